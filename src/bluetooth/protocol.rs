// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HM-10 response line classification.
//!
//! Pure mapping from a received text line to a display category. Front ends
//! rely on the categories for filtering and colouring.

use serde::{Deserialize, Serialize};

/// Semantic category of a response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseCategory {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "ECHO")]
    Echo,
    #[serde(rename = "DATA")]
    Data,
}

impl ResponseCategory {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Info => "INFO",
            Self::Echo => "ECHO",
            Self::Data => "DATA",
        }
    }
}

/// A classified line, ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedResponse {
    pub category: ResponseCategory,
    pub display_text: String,
}

/// Classify one response line. Total and side-effect free.
pub fn classify(line: &str) -> ClassifiedResponse {
    let text = line.trim();

    let (category, display_text) = match text {
        "OK" => (ResponseCategory::Success, text.to_string()),
        "ERROR" => (ResponseCategory::Error, text.to_string()),
        _ if text.starts_with("OK+") => (ResponseCategory::Info, text.to_string()),
        _ if text.starts_with("AT+") => (ResponseCategory::Echo, format!("Echo: {}", text)),
        _ => (ResponseCategory::Data, text.to_string()),
    };

    ClassifiedResponse {
        category,
        display_text,
    }
}
