use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use devpool_errors::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 关键度放大系数，保证关键度总是压过数值优先级
pub const CRITICALITY_SCALE: i64 = 10_000;

/// 合法的数值优先级范围（越小越紧急）
pub const MIN_PRIORITY: i32 = 0;
pub const MAX_PRIORITY: i32 = (CRITICALITY_SCALE - 1) as i32;

/// 任务ID，由调度器在提交时分配
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SchedulerError::validation_error(format!("无效的任务ID {s}: {e}")))
    }
}

/// Worker ID，即Worker池配置中的名称
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// 任务关键度，调度时优先于数值优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Criticality {
    pub fn weight(&self) -> i64 {
        match self {
            Criticality::Critical => 3,
            Criticality::High => 2,
            Criticality::Normal => 1,
            Criticality::Low => 0,
        }
    }
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Criticality::Low => "low",
            Criticality::Normal => "normal",
            Criticality::High => "high",
            Criticality::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for Criticality {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Criticality::Low),
            "normal" => Ok(Criticality::Normal),
            "high" => Ok(Criticality::High),
            "critical" => Ok(Criticality::Critical),
            other => Err(SchedulerError::validation_error(format!(
                "无效的关键度: {other}"
            ))),
        }
    }
}

/// 调度分数: 关键度权重 × K − 优先级，分数越高越先派发
pub fn dispatch_score(criticality: Criticality, priority: i32) -> i64 {
    criticality.weight() * CRITICALITY_SCALE - priority as i64
}

/// Worker资源描述，也用作任务的资源下限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_count: u32,
    pub memory_bytes: u64,
    pub accelerator_count: u32,
}

impl ResourceSpec {
    pub fn new(cpu_count: u32, memory_bytes: u64, accelerator_count: u32) -> Self {
        Self {
            cpu_count,
            memory_bytes,
            accelerator_count,
        }
    }

    /// 当前资源是否满足给定的下限
    pub fn satisfies(&self, minimum: &ResourceSpec) -> bool {
        self.cpu_count >= minimum.cpu_count
            && self.memory_bytes >= minimum.memory_bytes
            && self.accelerator_count >= minimum.accelerator_count
    }
}

/// 任务负载中的单个值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<PayloadValue>),
    Map(BTreeMap<String, PayloadValue>),
}

impl PayloadValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PayloadValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PayloadValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[PayloadValue]> {
        match self {
            PayloadValue::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for PayloadValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => PayloadValue::Null,
            serde_json::Value::Bool(b) => PayloadValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => PayloadValue::Integer(i),
                None => PayloadValue::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => PayloadValue::Text(s),
            serde_json::Value::Array(items) => {
                PayloadValue::List(items.into_iter().map(PayloadValue::from).collect())
            }
            serde_json::Value::Object(map) => PayloadValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, PayloadValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<PayloadValue> for serde_json::Value {
    fn from(value: PayloadValue) -> Self {
        match value {
            PayloadValue::Null => serde_json::Value::Null,
            PayloadValue::Bool(b) => serde_json::Value::Bool(b),
            PayloadValue::Integer(i) => serde_json::Value::from(i),
            PayloadValue::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            PayloadValue::Text(s) => serde_json::Value::String(s),
            PayloadValue::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            PayloadValue::Map(map) => serde_json::Value::Object(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

impl From<&str> for PayloadValue {
    fn from(s: &str) -> Self {
        PayloadValue::Text(s.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(s: String) -> Self {
        PayloadValue::Text(s)
    }
}

impl From<i64> for PayloadValue {
    fn from(v: i64) -> Self {
        PayloadValue::Integer(v)
    }
}

impl From<bool> for PayloadValue {
    fn from(v: bool) -> Self {
        PayloadValue::Bool(v)
    }
}

impl From<f64> for PayloadValue {
    fn from(v: f64) -> Self {
        PayloadValue::Float(v)
    }
}

impl<T: Into<PayloadValue>> From<Vec<T>> for PayloadValue {
    fn from(items: Vec<T>) -> Self {
        PayloadValue::List(items.into_iter().map(Into::into).collect())
    }
}

/// 任务负载: 字符串键到类型化值的映射，对调度器不透明
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskPayload(BTreeMap<String, PayloadValue>);

impl TaskPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<K: Into<String>, V: Into<PayloadValue>>(mut self, key: K, value: V) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert<K: Into<String>, V: Into<PayloadValue>>(&mut self, key: K, value: V) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&PayloadValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(PayloadValue::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PayloadValue)> {
        self.0.iter()
    }

    /// 从JSON对象构造负载，非对象的JSON值会被拒绝
    pub fn from_json(value: serde_json::Value) -> SchedulerResult<Self> {
        match value {
            serde_json::Value::Object(map) => Ok(Self(
                map.into_iter()
                    .map(|(k, v)| (k, PayloadValue::from(v)))
                    .collect(),
            )),
            other => Err(SchedulerError::validation_error(format!(
                "任务负载必须是JSON对象，实际为: {other}"
            ))),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.clone().into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dispatch_score_criticality_dominates() {
        let critical_low_urgency = dispatch_score(Criticality::Critical, MAX_PRIORITY);
        let high_top_urgency = dispatch_score(Criticality::High, MIN_PRIORITY);
        assert!(critical_low_urgency > high_top_urgency);

        assert!(dispatch_score(Criticality::Normal, 1) > dispatch_score(Criticality::Normal, 5));
        assert_eq!(dispatch_score(Criticality::Low, 0), 0);
    }

    #[test]
    fn test_criticality_parse() {
        assert_eq!("CRITICAL".parse::<Criticality>().unwrap(), Criticality::Critical);
        assert_eq!("normal".parse::<Criticality>().unwrap(), Criticality::Normal);
        assert!("urgent".parse::<Criticality>().is_err());
        assert_eq!(Criticality::default(), Criticality::Normal);
    }

    #[test]
    fn test_resource_spec_satisfies() {
        let worker = ResourceSpec::new(8, 16 << 30, 1);
        assert!(worker.satisfies(&ResourceSpec::default()));
        assert!(worker.satisfies(&ResourceSpec::new(4, 8 << 30, 1)));
        assert!(!worker.satisfies(&ResourceSpec::new(4, 8 << 30, 2)));
        assert!(!worker.satisfies(&ResourceSpec::new(16, 0, 0)));
    }

    #[test]
    fn test_payload_json_conversion() {
        let raw = json!({
            "prompt": "refactor module",
            "files": ["a.rs", "b.rs"],
            "max_tokens": 2048,
            "temperature": 0.2,
            "dry_run": false,
            "extra": null,
        });

        let payload = TaskPayload::from_json(raw.clone()).unwrap();
        assert_eq!(payload.get_str("prompt"), Some("refactor module"));
        assert_eq!(payload.get("max_tokens"), Some(&PayloadValue::Integer(2048)));
        assert_eq!(payload.get("files").and_then(|v| v.as_list()).map(|l| l.len()), Some(2));
        assert_eq!(payload.to_json(), raw);
    }

    #[test]
    fn test_payload_rejects_non_object() {
        let err = TaskPayload::from_json(json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
    }

    #[test]
    fn test_payload_serde_is_plain_json() {
        let payload = TaskPayload::new()
            .with("command", "cargo test")
            .with("args", vec!["--all"]);
        let encoded = serde_json::to_value(&payload).unwrap();
        assert_eq!(encoded, json!({"command": "cargo test", "args": ["--all"]}));

        let decoded: TaskPayload = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_task_id_parse() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<TaskId>().is_err());
    }
}
