// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    #[serde(skip_serializing_if = "String::is_empty")]
    #[serde(default)]
    pub model: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    #[serde(default)]
    pub os_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    #[serde(default)]
    pub locale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub screen_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub screen_height: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppSnapshot {
    #[serde(skip_serializing_if = "String::is_empty")]
    #[serde(default)]
    pub package_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    #[serde(default)]
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub first_install: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
}

/// Point-in-time device conditions, captured when the record is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStateSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub battery_fraction: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub charging: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub memory_available: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub memory_total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub storage_available: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub storage_total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub screen_on: Option<bool>,
    #[serde(skip_serializing_if = "String::is_empty")]
    #[serde(default)]
    pub orientation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub low_memory: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    #[serde(skip_serializing_if = "String::is_empty")]
    #[serde(default)]
    pub connection_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub vpn_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub proxy_active: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub heap_used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub heap_max: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub native_heap_used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub native_heap_max: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub core_count: Option<u32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    #[serde(default)]
    pub arch: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    #[serde(default)]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    #[serde(default)]
    pub importance: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub foreground: Option<bool>,
}

/// One entry of the bounded all-thread stack list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    #[serde(default)]
    pub state: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    #[serde(default)]
    pub stack_trace: String,
}

/// Fields present only on records produced by the native signal path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NativeCrashDetails {
    #[serde(skip_serializing_if = "String::is_empty")]
    #[serde(default)]
    pub signal_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub fault_address: Option<u64>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    #[serde(default)]
    pub registers: HashMap<String, u64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    #[serde(default)]
    pub memory_dump: String,
}

/// A memory-warning or network-change observation fed by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    #[serde(default)]
    pub description: String,
}
