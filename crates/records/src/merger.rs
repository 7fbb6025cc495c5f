use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use metrics::counter;
use tracing::{debug, error, warn};
use tuna_core::models::{PerformanceRecord, Provenance};

use crate::parser::split_entries;

/// 冲突解决模式，整次合并只取一个
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolveMode {
    /// 不一致的子项不输出并报告冲突
    #[default]
    Off,
    /// 选逗号最多的测量值，相同时取最先出现的
    Auto,
}

impl FromStr for ResolveMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "0" => Ok(ResolveMode::Off),
            "auto" | "1" => Ok(ResolveMode::Auto),
            _ => Err(format!("无效的解决模式: {s}，可选 0, 1, off, auto")),
        }
    }
}

impl fmt::Display for ResolveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveMode::Off => f.write_str("off"),
            ResolveMode::Auto => f.write_str("auto"),
        }
    }
}

/// 某个来源给出的测量值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Measurement {
    pub value: String,
    pub provenance: Provenance,
}

/// 一个键的累积状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeEntry {
    /// 只有一个来源，原样输出
    Simple { value: String, provenance: Provenance },
    /// 多个来源，按子项id汇总各来源的测量值
    Conflict(BTreeMap<String, Vec<Measurement>>),
}

impl MergeEntry {
    fn add_to_conflict(
        items: &mut BTreeMap<String, Vec<Measurement>>,
        value: &str,
        provenance: &Provenance,
    ) {
        for (id, measurement) in split_entries(value, provenance) {
            items.entry(id).or_default().push(Measurement {
                value: measurement,
                provenance: provenance.clone(),
            });
        }
    }

    fn absorb(&mut self, value: &str, provenance: &Provenance) {
        match self {
            MergeEntry::Simple {
                value: first,
                provenance: first_provenance,
            } => {
                let mut items = BTreeMap::new();
                Self::add_to_conflict(&mut items, first, first_provenance);
                Self::add_to_conflict(&mut items, value, provenance);
                *self = MergeEntry::Conflict(items);
            }
            MergeEntry::Conflict(items) => Self::add_to_conflict(items, value, provenance),
        }
    }
}

/// 未能自动解决的冲突
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyConflict {
    pub key: String,
    /// 各来源一致的子项
    pub consistent: Vec<(String, String)>,
    /// 各来源不一致的子项及其全部测量值
    pub conflicting: Vec<(String, Vec<Measurement>)>,
}

/// 一个键的处理方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Simple,
    /// 多来源但全部一致
    Trivial,
    Auto,
    Conflict(KeyConflict),
}

/// 单个键的合并结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub key: String,
    /// 写入主输出的值，没有可输出的子项时为 `None`
    pub value: Option<String>,
    pub resolution: Resolution,
}

impl ResolvedKey {
    pub fn line(&self) -> Option<String> {
        self.value.as_ref().map(|v| format!("{}={}", self.key, v))
    }

    pub fn conflict(&self) -> Option<&KeyConflict> {
        match &self.resolution {
            Resolution::Conflict(conflict) => Some(conflict),
            _ => None,
        }
    }
}

/// 整次合并结果，按键排序
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub keys: Vec<ResolvedKey>,
}

impl MergeOutcome {
    pub fn conflicts(&self) -> impl Iterator<Item = &KeyConflict> {
        self.keys.iter().filter_map(ResolvedKey::conflict)
    }

    pub fn has_conflicts(&self) -> bool {
        self.conflicts().next().is_some()
    }

    pub fn count(&self, pred: impl Fn(&Resolution) -> bool) -> usize {
        self.keys.iter().filter(|k| pred(&k.resolution)).count()
    }
}

fn join_entries<'a>(entries: impl Iterator<Item = (&'a str, &'a str)>) -> Option<String> {
    let joined = entries
        .map(|(id, value)| format!("{id}:{value}"))
        .collect::<Vec<_>>()
        .join(";");
    (!joined.is_empty()).then_some(joined)
}

fn all_equal(items: &[Measurement]) -> bool {
    items.windows(2).all(|w| w[0].value == w[1].value)
}

/// 逗号多者优先，相同时保留先出现的
fn most_specific(items: &[Measurement]) -> &Measurement {
    let mut best = &items[0];
    let mut best_commas = best.value.matches(',').count();
    for item in &items[1..] {
        let commas = item.value.matches(',').count();
        if commas > best_commas {
            best = item;
            best_commas = commas;
        }
    }
    best
}

/// 性能记录合并器
///
/// 按输入顺序累积记录：同一个键第一次出现时作为简单记录保存，再次出现时转为按子项id
/// 汇总的冲突条目。所有来源加入后调用 [`RecordMerger::resolve`] 一次性得出结果。
#[derive(Debug, Default)]
pub struct RecordMerger {
    entries: BTreeMap<String, MergeEntry>,
}

impl RecordMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: &PerformanceRecord) {
        match self.entries.get_mut(&record.key) {
            Some(entry) => entry.absorb(&record.value, &record.provenance),
            None => {
                self.entries.insert(
                    record.key.clone(),
                    MergeEntry::Simple {
                        value: record.value.clone(),
                        provenance: record.provenance.clone(),
                    },
                );
            }
        }
    }

    pub fn add_all<'a>(&mut self, records: impl IntoIterator<Item = &'a PerformanceRecord>) {
        for record in records {
            self.add(record);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, key: &str) -> Option<&MergeEntry> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn resolve(&self, mode: ResolveMode) -> MergeOutcome {
        let keys = self
            .entries
            .iter()
            .map(|(key, entry)| match entry {
                MergeEntry::Simple { value, .. } => ResolvedKey {
                    key: key.clone(),
                    value: Some(value.clone()),
                    resolution: Resolution::Simple,
                },
                MergeEntry::Conflict(items) => match mode {
                    ResolveMode::Auto => Self::resolve_auto(key, items),
                    ResolveMode::Off => Self::resolve_off(key, items),
                },
            })
            .collect();
        MergeOutcome { keys }
    }

    fn resolve_auto(key: &str, items: &BTreeMap<String, Vec<Measurement>>) -> ResolvedKey {
        let value = join_entries(
            items
                .iter()
                .map(|(id, group)| (id.as_str(), most_specific(group).value.as_str())),
        );
        debug!("自动解决: {}", key);
        ResolvedKey {
            key: key.to_string(),
            value,
            resolution: Resolution::Auto,
        }
    }

    fn resolve_off(key: &str, items: &BTreeMap<String, Vec<Measurement>>) -> ResolvedKey {
        let consistent: Vec<(String, String)> = items
            .iter()
            .filter(|(_, group)| all_equal(group))
            .map(|(id, group)| (id.clone(), group[0].value.clone()))
            .collect();
        let value = join_entries(consistent.iter().map(|(id, v)| (id.as_str(), v.as_str())));

        if consistent.len() == items.len() {
            warn!("无冲突合并: {}", key);
            return ResolvedKey {
                key: key.to_string(),
                value,
                resolution: Resolution::Trivial,
            };
        }

        error!("合并冲突: {}", key);
        counter!("tuna_merge_conflicts_total").increment(1);
        let conflicting = items
            .iter()
            .filter(|(_, group)| !all_equal(group))
            .map(|(id, group)| (id.clone(), group.clone()))
            .collect();
        ResolvedKey {
            key: key.to_string(),
            value,
            resolution: Resolution::Conflict(KeyConflict {
                key: key.to_string(),
                consistent,
                conflicting,
            }),
        }
    }
}
