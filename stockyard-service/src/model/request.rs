//! Requests, responses, and their wire twins
//!
//! The in-memory types carry parsed values (`NaiveDateTime`, `Duration`,
//! [`Resource`]); the `*Wire` twins carry the JSON encoding used by the HTTP
//! surface and template files. Decoding a wire request needs the owning
//! vendor's resource classes, so it happens where the registry is in scope.

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::field::Record;
use super::resource::{split_encoded, Resource, ResourceClass};
use crate::error::{Error, Result};
use crate::ids::CorrId;
use crate::timefmt;

/// Parsed request parameters
#[derive(Debug, Clone, Default)]
pub struct RequestParams {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    pub resolution: Option<Duration>,
    pub resource: Option<Resource>,
}

impl RequestParams {
    pub fn to_wire(&self) -> RequestParamsWire {
        RequestParamsWire {
            start: self.start.map(timefmt::format_timestamp),
            end: self.end.map(timefmt::format_timestamp),
            resolution: self.resolution.map(timefmt::format_duration),
            resource: self.resource.as_ref().map(Resource::encode),
        }
    }
}

/// A single parameterized data request
#[derive(Debug, Clone)]
pub struct Request {
    pub vendor: String,
    pub endpoint: String,
    pub params: RequestParams,
    /// Unset at construction; assigned server-side from the vendor's corr-id
    /// source before the request enters the pipeline
    pub corr_id: Option<CorrId>,
}

impl Request {
    pub fn new(vendor: impl Into<String>, endpoint: impl Into<String>, params: RequestParams) -> Self {
        Self {
            vendor: vendor.into(),
            endpoint: endpoint.into(),
            params,
            corr_id: None,
        }
    }

    /// The assigned correlation id; an error before assignment
    pub fn corr_id(&self) -> Result<&CorrId> {
        self.corr_id
            .as_ref()
            .ok_or_else(|| Error::Internal("request has no corr_id yet".into()))
    }

    pub fn to_wire(&self) -> RequestWire {
        RequestWire {
            vendor: self.vendor.clone(),
            endpoint: self.endpoint.clone(),
            params: self.params.to_wire(),
            corr_id: self.corr_id.clone(),
        }
    }
}

/// A completed (or failed) request
#[derive(Debug, Clone)]
pub struct Response {
    pub request: Request,
    /// Records matching the endpoint's `returns`; `None` on failure
    pub data: Option<Vec<Record>>,
    /// Error tag when the upstream call failed
    pub error: Option<String>,
}

impl Response {
    pub fn ok(request: Request, data: Vec<Record>) -> Self {
        Self {
            request,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(request: Request, error: impl Into<String>) -> Self {
        Self {
            request,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn to_wire(&self) -> ResponseWire {
        ResponseWire {
            request: self.request.to_wire(),
            data: self
                .data
                .as_ref()
                .map(|rows| rows.iter().map(|row| row.iter().map(|s| s.to_json()).collect()).collect()),
            error: self.error.clone(),
        }
    }
}

/// Wire encoding of [`RequestParams`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestParamsWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    /// `<ClassName>$<handle>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

impl RequestParamsWire {
    /// Decode against a vendor's resource classes
    pub fn decode(&self, resources: &BTreeMap<String, Arc<ResourceClass>>) -> Result<RequestParams> {
        let resource = match &self.resource {
            None => None,
            Some(encoded) => {
                let (class_name, handle) = split_encoded(encoded)?;
                let class = resources.get(class_name).ok_or_else(|| {
                    Error::BadRequest(format!("unknown resource class `{class_name}`"))
                })?;
                Some(class.decode(handle)?)
            }
        };
        Ok(RequestParams {
            start: self.start.as_deref().map(timefmt::parse_timestamp).transpose()?,
            end: self.end.as_deref().map(timefmt::parse_timestamp).transpose()?,
            resolution: self.resolution.as_deref().map(timefmt::parse_duration).transpose()?,
            resource,
        })
    }
}

/// Wire encoding of [`Request`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestWire {
    pub vendor: String,
    pub endpoint: String,
    #[serde(default)]
    pub params: RequestParamsWire,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corr_id: Option<CorrId>,
}

impl RequestWire {
    /// Decode against a vendor's resource classes
    pub fn decode(&self, resources: &BTreeMap<String, Arc<ResourceClass>>) -> Result<Request> {
        Ok(Request {
            vendor: self.vendor.clone(),
            endpoint: self.endpoint.clone(),
            params: self.params.decode(resources)?,
            corr_id: self.corr_id.clone(),
        })
    }
}

/// Wire encoding of [`Response`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseWire {
    pub request: RequestWire,
    pub data: Option<Vec<Vec<serde_json::Value>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
