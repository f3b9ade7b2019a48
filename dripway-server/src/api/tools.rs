// Copyright 2025 Sushanth (https://github.com/sushanthpy)
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

//! Tool discovery.

use super::AppState;
use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

/// GET /api/tools
pub async fn list_tools(State(state): State<AppState>) -> impl IntoResponse {
    let tools: Vec<_> = state
        .registry
        .list()
        .into_iter()
        .filter_map(|name| state.registry.lookup(name))
        .map(|entry| {
            json!({
                "name": entry.name,
                "endpoint": entry.endpoint_path,
                "method": entry.method,
                "required_params": entry.required_params,
                "optional_params": entry.optional_params,
                "category": entry.category,
            })
        })
        .collect();

    Json(json!({
        "tools": tools,
        "by_category": state.registry.by_category(),
        "total": state.registry.len(),
    }))
}
