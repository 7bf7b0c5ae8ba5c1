use crate::config::HitConditionSupport;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Source location of a breakpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: PathBuf,
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HitOperator {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
    Mod,
}

impl HitOperator {
    fn symbol(self) -> &'static str {
        match self {
            HitOperator::Eq => "==",
            HitOperator::Gt => ">",
            HitOperator::Ge => ">=",
            HitOperator::Lt => "<",
            HitOperator::Le => "<=",
            HitOperator::Mod => "%",
        }
    }
}

/// Pause only when the hit count satisfies `op count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitCondition {
    pub op: HitOperator,
    pub count: u32,
}

impl HitCondition {
    /// True if backends with given capability accept this condition.
    pub fn supported_by(&self, support: HitConditionSupport) -> bool {
        match support {
            HitConditionSupport::Full => true,
            HitConditionSupport::Exact => self.op == HitOperator::Eq,
        }
    }
}

impl FromStr for HitCondition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        // two char operators first
        let (op, rest) = [
            (">=", HitOperator::Ge),
            ("<=", HitOperator::Le),
            ("==", HitOperator::Eq),
            (">", HitOperator::Gt),
            ("<", HitOperator::Lt),
            ("%", HitOperator::Mod),
        ]
        .into_iter()
        .find_map(|(prefix, op)| s.strip_prefix(prefix).map(|rest| (op, rest)))
        .unwrap_or((HitOperator::Eq, s));

        let count: u32 = rest
            .trim()
            .parse()
            .map_err(|_| Error::Validation(format!("invalid hit condition `{s}`")))?;
        if op == HitOperator::Mod && count == 0 {
            return Err(Error::Validation("hit condition `%0` never matches".to_string()));
        }
        Ok(Self { op, count })
    }
}

impl Display for HitCondition {
    /// Exact counts are rendered as a bare number, the form every backend understands.
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.op {
            HitOperator::Eq => write!(f, "{}", self.count),
            op => write!(f, "{}{}", op.symbol(), self.count),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Verification {
    Pending,
    Verified,
    Unverified,
    Error,
}

/// Breakpoint as requested by a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointSpec {
    pub line: u32,
    #[serde(default)]
    pub column: Option<u32>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub hit_condition: Option<String>,
    #[serde(default)]
    pub log_message: Option<String>,
}

impl BreakpointSpec {
    pub fn at(line: u32) -> Self {
        Self {
            line,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Breakpoint {
    pub location: SourceLocation,
    pub condition: Option<String>,
    pub hit_condition: Option<HitCondition>,
    /// Presence makes the breakpoint a logpoint, it never pauses.
    pub log_message: Option<String>,
    pub verification: Verification,
    /// Backend-assigned id, known after verification.
    pub id: Option<i64>,
    /// Line where backend actually placed the breakpoint.
    pub actual_line: Option<u32>,
    pub message: Option<String>,
}

impl Breakpoint {
    /// Validate a caller request against adapter capabilities.
    pub fn from_spec(
        file: &Path,
        spec: &BreakpointSpec,
        hit_support: HitConditionSupport,
    ) -> Result<Self> {
        if spec.line == 0 {
            return Err(Error::Validation("breakpoint line numbers start at 1".to_string()));
        }
        let hit_condition = spec
            .hit_condition
            .as_deref()
            .map(HitCondition::from_str)
            .transpose()?;
        if let Some(hc) = hit_condition {
            if !hc.supported_by(hit_support) {
                return Err(Error::Validation(format!(
                    "hit condition `{}{}` is not supported by this adapter, only exact counts are",
                    hc.op.symbol(),
                    hc.count
                )));
            }
        }

        Ok(Self {
            location: SourceLocation {
                file: file.to_path_buf(),
                line: spec.line,
                column: spec.column,
            },
            condition: spec.condition.clone(),
            hit_condition,
            log_message: spec.log_message.clone(),
            verification: Verification::Pending,
            id: None,
            actual_line: None,
            message: None,
        })
    }

    pub fn is_logpoint(&self) -> bool {
        self.log_message.is_some()
    }

    fn to_source_breakpoint(&self) -> Value {
        let mut bp = json!({ "line": self.location.line });
        if let Some(column) = self.location.column {
            bp["column"] = json!(column);
        }
        if let Some(condition) = &self.condition {
            bp["condition"] = json!(condition);
        }
        if let Some(hc) = &self.hit_condition {
            bp["hitCondition"] = json!(hc.to_string());
        }
        if let Some(msg) = &self.log_message {
            bp["logMessage"] = json!(msg);
        }
        bp
    }

    fn apply(&mut self, reported: &Value) {
        if let Some(id) = reported.get("id").and_then(Value::as_i64) {
            self.id = Some(id);
        }
        if let Some(line) = reported.get("line").and_then(Value::as_u64) {
            self.actual_line = u32::try_from(line).ok();
        }
        self.message = reported
            .get("message")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);
        self.verification = match reported.get("verified").and_then(Value::as_bool) {
            Some(true) => Verification::Verified,
            _ => Verification::Unverified,
        };
    }
}

/// Breakpoints of one session grouped by source file.
#[derive(Debug, Clone, Default)]
pub struct BreakpointSet {
    by_file: BTreeMap<PathBuf, Vec<Breakpoint>>,
}

impl BreakpointSet {
    /// Replace all breakpoints of `file`, DAP `setBreakpoints` has the same semantic.
    pub fn replace(&mut self, file: &Path, breakpoints: Vec<Breakpoint>) {
        if breakpoints.is_empty() {
            self.by_file.remove(file);
        } else {
            self.by_file.insert(file.to_path_buf(), breakpoints);
        }
    }

    pub fn clear(&mut self) {
        self.by_file.clear();
    }

    pub fn files(&self) -> Vec<PathBuf> {
        self.by_file.keys().cloned().collect()
    }

    pub fn for_file(&self, file: &Path) -> &[Breakpoint] {
        self.by_file.get(file).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.by_file.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_file.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_file.is_empty()
    }

    /// Arguments of a `setBreakpoints` request for `file`.
    pub fn request_arguments(&self, file: &Path) -> Value {
        let breakpoints: Vec<Value> = self
            .for_file(file)
            .iter()
            .map(Breakpoint::to_source_breakpoint)
            .collect();
        json!({
            "source": {
                "path": file.to_string_lossy(),
                "name": file.file_name().map(|n| n.to_string_lossy().into_owned()),
            },
            "breakpoints": breakpoints,
        })
    }

    /// Apply `setBreakpoints` response body, entries are index-aligned with the request.
    pub fn apply_response(&mut self, file: &Path, body: &Value) {
        let Some(breakpoints) = self.by_file.get_mut(file) else {
            return;
        };
        let reported = body
            .get("breakpoints")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for (i, bp) in breakpoints.iter_mut().enumerate() {
            match reported.get(i) {
                Some(r) => bp.apply(r),
                None => {
                    bp.verification = Verification::Unverified;
                    bp.message = Some("backend did not report this breakpoint".to_string());
                }
            }
        }
    }

    /// Mark all breakpoints of `file` as failed.
    pub fn mark_error(&mut self, file: &Path, message: &str) {
        if let Some(breakpoints) = self.by_file.get_mut(file) {
            for bp in breakpoints {
                bp.verification = Verification::Error;
                bp.message = Some(message.to_string());
            }
        }
    }

    /// Apply a `breakpoint` event body. Return true if a known breakpoint changed.
    pub fn apply_event(&mut self, body: &Value) -> bool {
        let reason = body.get("reason").and_then(Value::as_str).unwrap_or_default();
        let Some(reported) = body.get("breakpoint") else {
            return false;
        };
        let Some(id) = reported.get("id").and_then(Value::as_i64) else {
            return false;
        };
        let Some(bp) = self
            .by_file
            .values_mut()
            .flatten()
            .find(|bp| bp.id == Some(id))
        else {
            return false;
        };

        match reason {
            "removed" => {
                bp.verification = Verification::Unverified;
                bp.id = None;
            }
            _ => bp.apply(reported),
        }
        true
    }
}
