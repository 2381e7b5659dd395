//! Query descriptions and their wire form

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use super::transport::HttpMethod;
use crate::db::QueryRecord;
use crate::error::{Error, Result};

/// Parameters shared by every analysis of a multi-analysis
pub const SHARED_MULTI_ANALYSIS_PARAMS: &[&str] = &[
    "event_collection",
    "timeframe",
    "timezone",
    "filters",
    "group_by",
    "interval",
];

/// Single analyses supported by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalysisType {
    Count,
    CountUnique,
    Minimum,
    Maximum,
    Sum,
    Average,
    Median,
    Percentile,
    SelectUnique,
    Extraction,
}

impl AnalysisType {
    pub const ALL: [AnalysisType; 10] = [
        AnalysisType::Count,
        AnalysisType::CountUnique,
        AnalysisType::Minimum,
        AnalysisType::Maximum,
        AnalysisType::Sum,
        AnalysisType::Average,
        AnalysisType::Median,
        AnalysisType::Percentile,
        AnalysisType::SelectUnique,
        AnalysisType::Extraction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisType::Count => "count",
            AnalysisType::CountUnique => "count_unique",
            AnalysisType::Minimum => "minimum",
            AnalysisType::Maximum => "maximum",
            AnalysisType::Sum => "sum",
            AnalysisType::Average => "average",
            AnalysisType::Median => "median",
            AnalysisType::Percentile => "percentile",
            AnalysisType::SelectUnique => "select_unique",
            AnalysisType::Extraction => "extraction",
        }
    }
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown analysis type {:?}", s)))
    }
}

/// What kind of request a [`Query`] turns into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    Analysis(AnalysisType),
    MultiAnalysis,
    Funnel,
    Saved,
    Dataset,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Analysis(analysis) => analysis.as_str(),
            QueryType::MultiAnalysis => "multi_analysis",
            QueryType::Funnel => "funnel",
            QueryType::Saved => "saved",
            QueryType::Dataset => "dataset",
        }
    }

    fn requires_name(&self) -> bool {
        matches!(self, QueryType::Saved | QueryType::Dataset)
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "multi_analysis" => Ok(QueryType::MultiAnalysis),
            "funnel" => Ok(QueryType::Funnel),
            "saved" => Ok(QueryType::Saved),
            "dataset" => Ok(QueryType::Dataset),
            other => other
                .parse::<AnalysisType>()
                .map(QueryType::Analysis)
                .map_err(|_| Error::Validation(format!("unknown query type {:?}", s))),
        }
    }
}

/// A query against the project
///
/// For analyses and funnels `properties` is the JSON request body. For
/// datasets it holds the URL parameters; saved analyses take none.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub query_type: QueryType,
    pub query_name: Option<String>,
    pub properties: Map<String, Value>,
}

impl Query {
    /// A single analysis, e.g. a count over `event_collection`
    pub fn analysis(analysis: AnalysisType, properties: Map<String, Value>) -> Self {
        Self {
            query_type: QueryType::Analysis(analysis),
            query_name: None,
            properties,
        }
    }

    /// A named analysis, used to key the result inside a multi-analysis
    pub fn named_analysis(
        analysis: AnalysisType,
        name: &str,
        properties: Map<String, Value>,
    ) -> Self {
        Self {
            query_type: QueryType::Analysis(analysis),
            query_name: Some(name.to_string()),
            properties,
        }
    }

    /// A funnel; `properties` must contain a `steps` array
    pub fn funnel(properties: Map<String, Value>) -> Self {
        Self {
            query_type: QueryType::Funnel,
            query_name: None,
            properties,
        }
    }

    /// The cached result of a saved analysis
    pub fn saved(name: &str) -> Self {
        Self {
            query_type: QueryType::Saved,
            query_name: Some(name.to_string()),
            properties: Map::new(),
        }
    }

    /// Results of a cached dataset
    pub fn dataset(name: &str, params: Map<String, Value>) -> Self {
        Self {
            query_type: QueryType::Dataset,
            query_name: Some(name.to_string()),
            properties: params,
        }
    }

    /// Combine single analyses into one multi-analysis request
    ///
    /// Shared parameters are taken from the first query. Each analysis is
    /// keyed by its name, falling back to its analysis type, and to
    /// `<analysis_type>_<n>` (counting up from the query's index) while that
    /// key is already used.
    pub fn multi_analysis(queries: &[Query]) -> Result<Self> {
        let first = queries.first().ok_or_else(|| {
            Error::Validation("multi-analysis needs at least one query".to_string())
        })?;

        let mut properties = Map::new();
        for key in SHARED_MULTI_ANALYSIS_PARAMS {
            if let Some(value) = first.properties.get(*key) {
                properties.insert((*key).to_string(), value.clone());
            }
        }

        let mut analyses = Map::new();
        for (index, query) in queries.iter().enumerate() {
            let analysis = match query.query_type {
                QueryType::Analysis(analysis) => analysis,
                other => {
                    return Err(Error::Validation(format!(
                        "{} queries cannot be part of a multi-analysis",
                        other
                    )))
                }
            };

            let mut entry = Map::new();
            entry.insert(
                "analysis_type".to_string(),
                Value::String(analysis.as_str().to_string()),
            );
            for (key, value) in &query.properties {
                if !SHARED_MULTI_ANALYSIS_PARAMS.contains(&key.as_str()) {
                    entry.insert(key.clone(), value.clone());
                }
            }

            let mut label = query
                .query_name
                .clone()
                .unwrap_or_else(|| analysis.as_str().to_string());
            let mut suffix = index;
            while analyses.contains_key(&label) {
                label = format!("{}_{}", analysis.as_str(), suffix);
                suffix += 1;
            }
            analyses.insert(label, Value::Object(entry));
        }
        properties.insert("analyses".to_string(), Value::Object(analyses));

        Ok(Self {
            query_type: QueryType::MultiAnalysis,
            query_name: None,
            properties,
        })
    }

    /// Rebuild a query from its persisted failure record
    pub fn from_record(record: &QueryRecord) -> Result<Self> {
        let query_type: QueryType = record.query_type.parse()?;
        let properties = match &record.properties {
            Value::Object(map) => map.clone(),
            _ => {
                return Err(Error::Validation(format!(
                    "stored query {} has no properties object",
                    record.id
                )))
            }
        };
        let query = Self {
            query_type,
            query_name: record.query_name.clone(),
            properties,
        };
        query.validate()?;
        Ok(query)
    }

    /// Check the query is complete enough to send
    pub fn validate(&self) -> Result<()> {
        if self.query_type.requires_name()
            && self.query_name.as_deref().map_or(true, str::is_empty)
        {
            return Err(Error::Validation(format!(
                "{} queries need a name",
                self.query_type
            )));
        }
        match self.query_type {
            QueryType::Funnel if !matches!(self.properties.get("steps"), Some(Value::Array(_))) => {
                Err(Error::Validation(
                    "funnel queries need a \"steps\" array".to_string(),
                ))
            }
            QueryType::MultiAnalysis
                if !matches!(self.properties.get("analyses"), Some(Value::Object(_))) =>
            {
                Err(Error::Validation(
                    "multi-analysis queries need an \"analyses\" object".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Stable identity used to find the query's failure record
    pub fn key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.query_type.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.query_name.as_deref().unwrap_or_default().as_bytes());
        hasher.update(b"\n");
        hasher.update(Value::Object(self.properties.clone()).to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Method, path below the project URL, and body
    pub(crate) fn request_parts(&self) -> Result<(HttpMethod, String, Option<Vec<u8>>)> {
        match self.query_type {
            QueryType::Analysis(_) | QueryType::Funnel | QueryType::MultiAnalysis => {
                let body = serde_json::to_vec(&self.properties)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                Ok((
                    HttpMethod::Post,
                    format!("/queries/{}", self.query_type.as_str()),
                    Some(body),
                ))
            }
            QueryType::Saved => Ok((
                HttpMethod::Get,
                format!("/queries/saved/{}/result", self.encoded_name()),
                None,
            )),
            QueryType::Dataset => {
                let mut path = format!("/datasets/{}/results", self.encoded_name());
                let params = encode_params(&self.properties);
                if !params.is_empty() {
                    path.push('?');
                    path.push_str(&params);
                }
                Ok((HttpMethod::Get, path, None))
            }
        }
    }

    fn encoded_name(&self) -> String {
        urlencoding::encode(self.query_name.as_deref().unwrap_or_default()).into_owned()
    }
}

/// Encode query parameters; non-string values are sent as JSON
fn encode_params(params: &Map<String, Value>) -> String {
    params
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(&value)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}
