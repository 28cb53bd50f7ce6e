//! ABAC conditions attached to relationship tuples.
//!
//! A tuple may carry predicates over the caller's runtime context: a daily
//! time window, a CIDR allowlist, a device set, and exact-match attributes.
//! All present predicates must hold. A tuple with conditions but no context
//! to evaluate them against denies.

use chrono::NaiveTime;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::{debug, warn};

/// Inclusive daily time window. Accepts `HH:MM`, `HH:MM:SS`, or a full ISO
/// timestamp (only the time-of-day part is compared).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: String,
    pub end: String,
}

/// Conditions stored on a tuple, in the wire format used for dumps and the
/// write API.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TupleConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_ips: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_devices: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<BTreeMap<String, serde_json::Value>>,
}

impl TupleConditions {
    pub fn is_empty(&self) -> bool {
        self.time_window.is_none()
            && self.allowed_ips.is_none()
            && self.allowed_devices.is_none()
            && self.attributes.is_none()
    }
}

/// Runtime context supplied by the caller of a check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessContext {
    /// Current time, `HH:MM[:SS]` or full ISO timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl AccessContext {
    pub fn at_time(time: &str) -> Self {
        Self {
            time: Some(time.to_string()),
            ..Default::default()
        }
    }

    pub fn from_ip(ip: IpAddr) -> Self {
        Self {
            ip: Some(ip),
            ..Default::default()
        }
    }
}

/// Extract a comparable time-of-day from `HH:MM`, `HH:MM:SS`, or an ISO
/// timestamp (the part after `T`, offsets stripped).
fn parse_time_of_day(raw: &str) -> Option<NaiveTime> {
    let time_part = match raw.split_once('T') {
        Some((_, rest)) => rest,
        None => raw,
    };
    // Strip offset / zone suffixes: "12:00:00+02:00", "12:00:00Z".
    let trimmed = time_part
        .split(['+', 'Z'])
        .next()
        .unwrap_or(time_part);
    // A leading '-' never appears in a bare time; anything after one is an
    // offset ("12:00:00-05:00").
    let trimmed = match trimmed.char_indices().find(|(i, c)| *i > 0 && *c == '-') {
        Some((idx, _)) => &trimmed[..idx],
        None => trimmed,
    };

    NaiveTime::parse_from_str(trimmed, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M"))
        .ok()
}

/// Evaluate conditions against a runtime context. `true` when every present
/// predicate holds; missing context while conditions exist denies.
pub fn evaluate(conditions: &TupleConditions, context: Option<&AccessContext>) -> bool {
    if conditions.is_empty() {
        return true;
    }

    let Some(context) = context else {
        warn!("ABAC conditions present but no context provided, denying");
        return false;
    };

    if let Some(window) = &conditions.time_window {
        let Some(current) = context.time.as_deref().and_then(parse_time_of_day) else {
            debug!("time window condition but no usable 'time' in context, denying");
            return false;
        };
        let (Some(start), Some(end)) = (
            parse_time_of_day(&window.start),
            parse_time_of_day(&window.end),
        ) else {
            warn!(
                start = %window.start,
                end = %window.end,
                "unparseable time window on tuple, denying"
            );
            return false;
        };
        if !(start <= current && current <= end) {
            debug!(%current, %start, %end, "time outside window, denying");
            return false;
        }
    }

    if let Some(allowed_ips) = &conditions.allowed_ips {
        let Some(ip) = context.ip else {
            debug!("IP allowlist condition but no 'ip' in context, denying");
            return false;
        };
        let mut allowed = false;
        for cidr in allowed_ips {
            match cidr.parse::<IpNetwork>() {
                Ok(network) => {
                    if network.contains(ip) {
                        allowed = true;
                        break;
                    }
                }
                Err(_) => {
                    warn!(%cidr, "invalid CIDR in allowlist, skipping");
                }
            }
        }
        if !allowed {
            debug!(%ip, "ip not in allowlist, denying");
            return false;
        }
    }

    if let Some(allowed_devices) = &conditions.allowed_devices {
        let in_set = context
            .device
            .as_ref()
            .is_some_and(|device| allowed_devices.contains(device));
        if !in_set {
            debug!(device = ?context.device, "device not in allowed set, denying");
            return false;
        }
    }

    if let Some(attributes) = &conditions.attributes {
        for (key, expected) in attributes {
            if context.attributes.get(key) != Some(expected) {
                debug!(%key, "attribute mismatch, denying");
                return false;
            }
        }
    }

    true
}
