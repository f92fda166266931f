// src/rabbitmq/topology.rs
//! Exchange kinds and the naming convention shared with every other service
//! on the bus.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::{BusError, Result};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Topic,
    Direct,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = BusError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "topic" => Ok(ExchangeKind::Topic),
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "headers" => Ok(ExchangeKind::Headers),
            "" => Err(BusError::invalid_argument("exchange kind")),
            other => Err(BusError::InvalidArgument(format!(
                "Invalid exchange kind with value {}",
                other
            ))),
        }
    }
}

fn require<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    if value.trim().is_empty() {
        return Err(BusError::invalid_argument(field));
    }
    Ok(value)
}

/// `{environment}.exchange.{kind}.{service}.{name}`
pub fn exchange_name(
    environment: &str,
    kind: ExchangeKind,
    service: &str,
    name: &str,
) -> Result<String> {
    let service = require("service", service)?;
    let environment = require("environment", environment)?;
    let name = require("name", name)?;
    Ok(format!("{}.exchange.{}.{}.{}", environment, kind, service, name))
}

/// `{environment}.queue.{service}.{consumer}`
pub fn queue_name(environment: &str, service: &str, consumer: &str) -> Result<String> {
    let service = require("service", service)?;
    let environment = require("environment", environment)?;
    let consumer = require("consumer name", consumer)?;
    Ok(format!("{}.queue.{}.{}", environment, service, consumer))
}
