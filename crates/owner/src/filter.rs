// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::HashSet;

use regex::{Regex, RegexBuilder};

use cdc_types::config::ReplicaConfig;
use cdc_types::model::{DdlJob, DdlJobType};
use cdc_types::Ts;

/// Schemas which are never replicated.
const SYSTEM_SCHEMAS: [&str; 4] = [
    "information_schema",
    "performance_schema",
    "metrics_schema",
    "mysql",
];

pub fn is_system_schema(schema: &str) -> bool {
    SYSTEM_SCHEMAS
        .iter()
        .any(|system| system.eq_ignore_ascii_case(schema))
}

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("invalid filter rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },
}

#[derive(Debug, Clone)]
struct Rule {
    negated: bool,
    schema: Regex,
    table: Regex,
    matches_all_tables: bool,
}

/// Decides which schemas, tables and transactions are replicated.
#[derive(Debug, Clone)]
pub struct Filter {
    rules: Vec<Rule>,
    ignore_txn_start_ts: HashSet<Ts>,
}

impl Filter {
    pub fn new(config: &ReplicaConfig) -> Result<Self, FilterError> {
        let rules = config
            .filter
            .rules
            .iter()
            .map(|rule| parse_rule(rule, config.case_sensitive))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            rules,
            ignore_txn_start_ts: config.filter.ignore_txn_start_ts.iter().copied().collect(),
        })
    }

    fn last_match(&self, schema: &str, table: &str) -> Option<&Rule> {
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.schema.is_match(schema) && rule.table.is_match(table))
    }

    pub fn should_ignore_table(&self, schema: &str, table: &str) -> bool {
        if is_system_schema(schema) {
            return true;
        }
        self.last_match(schema, table)
            .map(|rule| rule.negated)
            .unwrap_or(true)
    }

    /// A schema is replicated if some of its tables may be. Negated rules only exclude a
    /// schema as a whole when they cover all of its tables.
    pub fn should_ignore_schema(&self, schema: &str) -> bool {
        if is_system_schema(schema) {
            return true;
        }
        self.rules
            .iter()
            .rev()
            .find(|rule| {
                rule.schema.is_match(schema) && (!rule.negated || rule.matches_all_tables)
            })
            .map(|rule| rule.negated)
            .unwrap_or(true)
    }

    pub fn should_ignore_txn(&self, start_ts: Ts, schema: &str, table: &str) -> bool {
        self.ignore_txn_start_ts.contains(&start_ts) || self.should_ignore_table(schema, table)
    }

    pub fn should_ignore_ddl_job(&self, job: &DdlJob) -> bool {
        if self.ignore_txn_start_ts.contains(&job.start_ts) {
            return true;
        }
        match job.job_type {
            DdlJobType::CreateSchema
            | DdlJobType::DropSchema
            | DdlJobType::ModifySchemaCharsetAndCollate => {
                self.should_ignore_schema(&job.schema_name)
            }
            _ => {
                let table = job
                    .table_info
                    .as_ref()
                    .map(|info| info.name.as_str())
                    .unwrap_or(job.table_name.as_str());
                self.should_ignore_table(&job.schema_name, table)
            }
        }
    }
}

fn parse_rule(rule: &str, case_sensitive: bool) -> Result<Rule, FilterError> {
    let invalid = |reason: &str| FilterError::InvalidRule {
        rule: rule.to_owned(),
        reason: reason.to_owned(),
    };

    let trimmed = rule.trim();
    let (negated, pattern) = match trimmed.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let (schema, table) = pattern
        .split_once('.')
        .ok_or_else(|| invalid("expected <schema>.<table>"))?;
    if schema.is_empty() || table.is_empty() {
        return Err(invalid("empty schema or table pattern"));
    }

    Ok(Rule {
        negated,
        schema: glob_to_regex(schema, case_sensitive).map_err(|err| invalid(&err))?,
        table: glob_to_regex(table, case_sensitive).map_err(|err| invalid(&err))?,
        matches_all_tables: table == "*",
    })
}

fn glob_to_regex(glob: &str, case_sensitive: bool) -> Result<Regex, String> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            '[' => {
                pattern.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    pattern.push('^');
                }
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    if c == '\\' || c == '[' {
                        pattern.push('\\');
                    }
                    pattern.push(c);
                }
                if !closed {
                    return Err(format!("unclosed character class in '{glob}'"));
                }
                pattern.push(']');
            }
            other => pattern.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    pattern.push('$');

    RegexBuilder::new(&pattern)
        .case_insensitive(!case_sensitive)
        .build()
        .map_err(|err| err.to_string())
}
