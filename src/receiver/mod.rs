// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Next-session ingestion of the native crash trailer.
//!
//! The signal handler can only write a flat text file; this module parses it
//! back into a full [`CrashReport`] at the next startup, after which the
//! trailer is deleted and the record flows through grouping, persistence and
//! the sender like any other crash.

mod trailer;

pub use trailer::{parse_trailer, ParsedNativeCrash};
