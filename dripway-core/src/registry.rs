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

//! Tool registry.
//!
//! A read-only table mapping a tool name to its downstream endpoint, HTTP
//! method and parameter schema. Built once at startup; no I/O, no mutation
//! after construction.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// One downstream endpoint the gateway knows how to call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolEntry {
    pub name: &'static str,
    pub endpoint_path: &'static str,
    pub method: &'static str,
    pub required_params: &'static [&'static str],
    pub optional_params: &'static [&'static str],
    pub category: &'static str,
}

/// Outcome of checking a params object against a tool's required set.
#[derive(Debug, Clone, Serialize)]
pub struct ParamCheck {
    pub ok: bool,
    pub missing: Vec<String>,
}

macro_rules! tool {
    ($name:literal, $path:literal, req: [$($req:literal),*], opt: [$($opt:literal),*]) => {
        ToolEntry {
            name: $name,
            endpoint_path: $path,
            method: "POST",
            required_params: &[$($req),*],
            optional_params: &[$($opt),*],
            // filled in by `ToolRegistry::from_entries`
            category: "",
        }
    };
}

/// Category grouping by substring/prefix match over the tool name.
fn category_of(name: &str) -> &'static str {
    if name.contains("linkedin") {
        if name.contains("company") {
            return "linkedin-companies";
        }
        if name.contains("post") || name.contains("comment") || name.contains("reaction") {
            return "linkedin-posts";
        }
        return "linkedin-profiles";
    }
    for (prefix, category) in [
        ("instagram", "instagram"),
        ("twitter", "twitter"),
        ("reddit", "reddit"),
        ("sec", "sec"),
    ] {
        if name.contains(prefix) {
            return category;
        }
    }
    "other"
}

/// The default downstream surface.
const DEFAULT_TOOLS: &[ToolEntry] = &[
    tool!("get_linkedin_profile", "/api/linkedin/profile", req: ["user"], opt: []),
    tool!("get_linkedin_profile_posts", "/api/linkedin/profile/posts", req: ["user"], opt: ["limit"]),
    tool!("get_linkedin_profile_comments", "/api/linkedin/profile/comments", req: ["user"], opt: ["limit"]),
    tool!("get_linkedin_profile_reactions", "/api/linkedin/profile/reactions", req: ["user"], opt: ["limit"]),
    tool!("get_linkedin_company", "/api/linkedin/company", req: ["company"], opt: []),
    tool!("get_linkedin_company_posts", "/api/linkedin/company/posts", req: ["company"], opt: ["limit"]),
    tool!("get_linkedin_post_comments", "/api/linkedin/post/comments", req: ["post_url"], opt: ["limit", "page"]),
    tool!("get_linkedin_post_reactions", "/api/linkedin/post/reactions", req: ["post_url"], opt: ["limit"]),
    tool!("get_instagram_profile", "/api/instagram/profile", req: ["handle"], opt: []),
    tool!("get_instagram_posts", "/api/instagram/posts", req: ["handle"], opt: ["limit"]),
    tool!("get_twitter_profile", "/api/twitter/profile", req: ["handle"], opt: []),
    tool!("get_twitter_posts", "/api/twitter/posts", req: ["handle"], opt: ["limit"]),
    tool!("get_reddit_user_posts", "/api/reddit/user/posts", req: ["username"], opt: ["limit"]),
    tool!("get_sec_filings", "/api/sec/filings", req: ["ticker"], opt: ["form_type", "limit"]),
];

/// Immutable tool lookup table.
pub struct ToolRegistry {
    entries: HashMap<&'static str, ToolEntry>,
    ordered: Vec<&'static str>,
}

impl ToolRegistry {
    /// Build the registry from the default tool table.
    pub fn new() -> Self {
        Self::from_entries(DEFAULT_TOOLS)
    }

    fn from_entries(table: &[ToolEntry]) -> Self {
        let mut entries = HashMap::with_capacity(table.len());
        let mut ordered = Vec::with_capacity(table.len());
        for entry in table {
            let mut entry = entry.clone();
            entry.category = category_of(entry.name);
            ordered.push(entry.name);
            entries.insert(entry.name, entry);
        }
        Self { entries, ordered }
    }

    pub fn lookup(&self, tool_name: &str) -> Option<&ToolEntry> {
        self.entries.get(tool_name)
    }

    pub fn contains(&self, tool_name: &str) -> bool {
        self.entries.contains_key(tool_name)
    }

    /// Check that every required parameter is present, non-null and not an
    /// empty string.
    pub fn validate(&self, tool_name: &str, params: &Value) -> ParamCheck {
        let Some(entry) = self.lookup(tool_name) else {
            return ParamCheck {
                ok: false,
                missing: vec![],
            };
        };

        let missing: Vec<String> = entry
            .required_params
            .iter()
            .filter(|name| {
                match params.get(**name) {
                    None | Some(Value::Null) => true,
                    Some(Value::String(s)) => s.is_empty(),
                    Some(_) => false,
                }
            })
            .map(|name| name.to_string())
            .collect();

        ParamCheck {
            ok: missing.is_empty(),
            missing,
        }
    }

    /// Tool names in table order.
    pub fn list(&self) -> Vec<&'static str> {
        self.ordered.clone()
    }

    /// Tool names grouped by category, categories sorted by name.
    pub fn by_category(&self) -> BTreeMap<&'static str, Vec<&'static str>> {
        let mut grouped: BTreeMap<&'static str, Vec<&'static str>> = BTreeMap::new();
        for name in &self.ordered {
            let entry = &self.entries[name];
            grouped.entry(entry.category).or_default().push(entry.name);
        }
        grouped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_known_tool() {
        let registry = ToolRegistry::new();
        let entry = registry.lookup("get_linkedin_profile").unwrap();
        assert_eq!(entry.endpoint_path, "/api/linkedin/profile");
        assert_eq!(entry.method, "POST");
        assert_eq!(entry.required_params, &["user"]);
    }

    #[test]
    fn lookup_unknown_tool() {
        let registry = ToolRegistry::new();
        assert!(registry.lookup("nope").is_none());
    }

    #[test]
    fn validate_flags_absent_null_and_empty() {
        let registry = ToolRegistry::new();

        let ok = registry.validate(
            "get_linkedin_profile",
            &json!({"user": "https://linkedin.com/in/x"}),
        );
        assert!(ok.ok);

        for params in [json!({}), json!({"user": null}), json!({"user": ""})] {
            let check = registry.validate("get_linkedin_profile", &params);
            assert!(!check.ok, "params {params} should be rejected");
            assert_eq!(check.missing, vec!["user".to_string()]);
        }
    }

    #[test]
    fn validate_ignores_optional_params() {
        let registry = ToolRegistry::new();
        let check = registry.validate("get_sec_filings", &json!({"ticker": "AAPL"}));
        assert!(check.ok);
        assert!(check.missing.is_empty());
    }

    #[test]
    fn categories_follow_name_rules() {
        let registry = ToolRegistry::new();
        let grouped = registry.by_category();

        assert!(grouped["linkedin-companies"].contains(&"get_linkedin_company_posts"));
        assert!(grouped["linkedin-posts"].contains(&"get_linkedin_post_comments"));
        assert!(grouped["linkedin-profiles"].contains(&"get_linkedin_profile"));
        assert!(grouped["instagram"].contains(&"get_instagram_posts"));
        assert!(grouped["twitter"].contains(&"get_twitter_profile"));
        assert!(grouped["reddit"].contains(&"get_reddit_user_posts"));
        assert!(grouped["sec"].contains(&"get_sec_filings"));

        // company beats post when both substrings are present
        let company_posts = registry.lookup("get_linkedin_company_posts").unwrap();
        assert_eq!(company_posts.category, "linkedin-companies");
    }

    #[test]
    fn list_covers_every_entry() {
        let registry = ToolRegistry::new();
        assert_eq!(registry.list().len(), registry.len());
        assert!(registry.list().contains(&"get_linkedin_profile"));
    }
}
