// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Catalog record types.
//!
//! A [`CatalogRecord`] is one row of a watched catalog table: a UID
//! definition ([`UidMeta`]), time-series metadata ([`TsMeta`]) or an
//! [`Annotation`]. Every record carries a `version`, `created`/`last_update`
//! timestamps (epoch millis) and a `custom` map that mirrors the version and
//! primary key under [`VERSION_KEY`] and [`PK_KEY`].
//!
//! # Example
//!
//! ```
//! use catalog_sync::record::{UidMeta, UidType, CatalogRecord, CatalogTable};
//!
//! let host = UidMeta::new(UidType::Tagk, "000001", "host");
//! let record = CatalogRecord::Uid(host);
//!
//! assert_eq!(record.table(), CatalogTable::Tagk);
//! assert_eq!(record.natural_key(), "000001");
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Reserved custom key mirroring the record version.
pub const VERSION_KEY: &str = "tsd.catalog.version";

/// Reserved custom key mirroring the record primary key.
pub const PK_KEY: &str = "tsd.catalog.pk";

/// Free-form string attributes attached to a record.
pub type CustomMap = BTreeMap<String, String>;

/// Current wall clock in epoch millis.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ═══════════════════════════════════════════════════════════════════════════
// Tables and operations
// ═══════════════════════════════════════════════════════════════════════════

/// The kind of name a UID is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UidType {
    Metric,
    Tagk,
    Tagv,
}

impl UidType {
    pub const ALL: [UidType; 3] = [UidType::Metric, UidType::Tagk, UidType::Tagv];

    #[must_use]
    pub fn table(self) -> CatalogTable {
        match self {
            UidType::Metric => CatalogTable::Metric,
            UidType::Tagk => CatalogTable::Tagk,
            UidType::Tagv => CatalogTable::Tagv,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            UidType::Metric => "METRIC",
            UidType::Tagk => "TAGK",
            UidType::Tagv => "TAGV",
        }
    }
}

impl fmt::Display for UidType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog tables watched by change capture, in sync processing order.
///
/// UID definitions sort before the time-series metadata that references
/// them, and annotations come last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CatalogTable {
    Tagk,
    Tagv,
    Metric,
    TsMeta,
    Annotation,
}

impl CatalogTable {
    /// All watched tables in processing order.
    pub const WATCHED: [CatalogTable; 5] = [
        CatalogTable::Tagk,
        CatalogTable::Tagv,
        CatalogTable::Metric,
        CatalogTable::TsMeta,
        CatalogTable::Annotation,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            CatalogTable::Tagk => "TSD_TAGK",
            CatalogTable::Tagv => "TSD_TAGV",
            CatalogTable::Metric => "TSD_METRIC",
            CatalogTable::TsMeta => "TSD_TSMETA",
            CatalogTable::Annotation => "TSD_ANNOTATION",
        }
    }

    /// Primary key column of the table.
    #[must_use]
    pub fn pk_column(self) -> &'static str {
        match self {
            CatalogTable::Tagk | CatalogTable::Tagv | CatalogTable::Metric => "XUID",
            CatalogTable::TsMeta => "FQNID",
            CatalogTable::Annotation => "ANNID",
        }
    }

    /// Position in the processing order.
    #[must_use]
    pub fn ordering(self) -> i64 {
        match self {
            CatalogTable::Tagk => 0,
            CatalogTable::Tagv => 1,
            CatalogTable::Metric => 2,
            CatalogTable::TsMeta => 3,
            CatalogTable::Annotation => 4,
        }
    }

    #[must_use]
    pub fn uid_type(self) -> Option<UidType> {
        match self {
            CatalogTable::Metric => Some(UidType::Metric),
            CatalogTable::Tagk => Some(UidType::Tagk),
            CatalogTable::Tagv => Some(UidType::Tagv),
            _ => None,
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::WATCHED
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for CatalogTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Row-level mutation kind recorded in the sync queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    Insert,
    Update,
    Delete,
}

impl OpType {
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            OpType::Insert => "I",
            OpType::Update => "U",
            OpType::Delete => "D",
        }
    }

    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "I" => Some(OpType::Insert),
            "U" => Some(OpType::Update),
            "D" => Some(OpType::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════════

/// A metric, tag key or tag value UID definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UidMeta {
    /// Hex encoded fixed-width UID
    pub uid: String,
    pub uid_type: UidType,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub custom: CustomMap,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub last_update: i64,
    #[serde(default)]
    pub version: i64,
}

impl UidMeta {
    pub fn new(uid_type: UidType, uid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uid: uid.into().to_ascii_uppercase(),
            uid_type,
            name: name.into(),
            display_name: String::new(),
            description: String::new(),
            notes: String::new(),
            custom: CustomMap::new(),
            created: 0,
            last_update: 0,
            version: 0,
        }
    }

    /// A uid-only reference, used where only identity matters.
    #[must_use]
    pub fn reference(uid_type: UidType, uid: &str) -> Self {
        Self::new(uid_type, uid, "")
    }
}

/// Time-series metadata: a metric plus an ordered set of tag pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TsMeta {
    /// Catalog primary key, assigned on first insert
    #[serde(default)]
    pub fqnid: Option<i64>,
    pub tsuid: String,
    pub metric: UidMeta,
    /// Alternating tag key / tag value definitions
    pub tags: Vec<UidMeta>,
    /// Denormalized `metric:tagk=tagv,...` display string
    #[serde(default)]
    pub fqn: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub data_type: String,
    #[serde(default)]
    pub retention: i64,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
    #[serde(default)]
    pub custom: CustomMap,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub last_update: i64,
    #[serde(default)]
    pub version: i64,
}

impl TsMeta {
    /// Build a TSMeta from its metric and `(tagk, tagv)` pairs. The TSUID is
    /// the metric UID followed by the tag pair UIDs sorted by tag key UID.
    pub fn new(metric: UidMeta, pairs: Vec<(UidMeta, UidMeta)>) -> Self {
        let mut pairs = pairs;
        pairs.sort_by(|a, b| a.0.uid.cmp(&b.0.uid));
        let mut tsuid = metric.uid.clone();
        let mut tags = Vec::with_capacity(pairs.len() * 2);
        for (k, v) in pairs {
            tsuid.push_str(&k.uid);
            tsuid.push_str(&v.uid);
            tags.push(k);
            tags.push(v);
        }
        let mut meta = Self {
            fqnid: None,
            tsuid,
            metric,
            tags,
            fqn: String::new(),
            display_name: String::new(),
            description: String::new(),
            notes: String::new(),
            units: String::new(),
            data_type: String::new(),
            retention: 0,
            min_value: None,
            max_value: None,
            custom: CustomMap::new(),
            created: 0,
            last_update: 0,
            version: 0,
        };
        meta.fqn = meta.compute_fqn();
        meta
    }

    /// Tag pairs as `(tagk, tagv)` references.
    pub fn tag_pairs(&self) -> impl Iterator<Item = (&UidMeta, &UidMeta)> {
        self.tags.chunks_exact(2).map(|c| (&c[0], &c[1]))
    }

    /// Denormalized display string from the embedded names.
    #[must_use]
    pub fn compute_fqn(&self) -> String {
        let pairs: Vec<String> = self
            .tag_pairs()
            .map(|(k, v)| tag_pair_name(&k.name, &v.name))
            .collect();
        fqn(&self.metric.name, &pairs)
    }
}

/// A timestamped note, attached to one time series or global when `tsuid` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default)]
    pub annid: Option<i64>,
    #[serde(default)]
    pub tsuid: Option<String>,
    pub start_time: i64,
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub custom: CustomMap,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub last_update: i64,
    #[serde(default)]
    pub version: i64,
}

impl Annotation {
    pub fn new(tsuid: Option<String>, start_time: i64, description: impl Into<String>) -> Self {
        Self {
            annid: None,
            tsuid,
            start_time,
            end_time: None,
            description: description.into(),
            notes: String::new(),
            custom: CustomMap::new(),
            created: 0,
            last_update: 0,
            version: 0,
        }
    }

    /// Natural key: `start_time` and owning TSUID (empty for global annotations).
    #[must_use]
    pub fn natural_key(&self) -> String {
        annotation_key(self.start_time, self.tsuid.as_deref())
    }
}

#[must_use]
pub fn annotation_key(start_time: i64, tsuid: Option<&str>) -> String {
    format!("{}:{}", start_time, tsuid.unwrap_or(""))
}

/// Tag pair UID: tag key UID followed by tag value UID.
#[must_use]
pub fn tag_pair_uid(tagk: &str, tagv: &str) -> String {
    format!("{tagk}{tagv}")
}

/// Tag pair display name, `tagk=tagv`.
#[must_use]
pub fn tag_pair_name(tagk: &str, tagv: &str) -> String {
    format!("{tagk}={tagv}")
}

/// Fully qualified name, `metric:k1=v1,k2=v2`.
#[must_use]
pub fn fqn(metric: &str, pair_names: &[String]) -> String {
    format!("{}:{}", metric, pair_names.join(","))
}

/// Any row of a watched catalog table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatalogRecord {
    Uid(UidMeta),
    TsMeta(TsMeta),
    Annotation(Annotation),
}

impl CatalogRecord {
    #[must_use]
    pub fn table(&self) -> CatalogTable {
        match self {
            CatalogRecord::Uid(u) => u.uid_type.table(),
            CatalogRecord::TsMeta(_) => CatalogTable::TsMeta,
            CatalogRecord::Annotation(_) => CatalogTable::Annotation,
        }
    }

    /// Catalog primary key as text, if assigned.
    #[must_use]
    pub fn pk(&self) -> Option<String> {
        match self {
            CatalogRecord::Uid(u) => Some(u.uid.clone()),
            CatalogRecord::TsMeta(t) => t.fqnid.map(|id| id.to_string()),
            CatalogRecord::Annotation(a) => a.annid.map(|id| id.to_string()),
        }
    }

    /// Key the primary store addresses this record by.
    #[must_use]
    pub fn natural_key(&self) -> String {
        match self {
            CatalogRecord::Uid(u) => u.uid.clone(),
            CatalogRecord::TsMeta(t) => t.tsuid.clone(),
            CatalogRecord::Annotation(a) => a.natural_key(),
        }
    }

    #[must_use]
    pub fn version(&self) -> i64 {
        match self {
            CatalogRecord::Uid(u) => u.version,
            CatalogRecord::TsMeta(t) => t.version,
            CatalogRecord::Annotation(a) => a.version,
        }
    }

    #[must_use]
    pub fn created(&self) -> i64 {
        match self {
            CatalogRecord::Uid(u) => u.created,
            CatalogRecord::TsMeta(t) => t.created,
            CatalogRecord::Annotation(a) => a.created,
        }
    }

    #[must_use]
    pub fn last_update(&self) -> i64 {
        match self {
            CatalogRecord::Uid(u) => u.last_update,
            CatalogRecord::TsMeta(t) => t.last_update,
            CatalogRecord::Annotation(a) => a.last_update,
        }
    }

    #[must_use]
    pub fn custom(&self) -> &CustomMap {
        match self {
            CatalogRecord::Uid(u) => &u.custom,
            CatalogRecord::TsMeta(t) => &t.custom,
            CatalogRecord::Annotation(a) => &a.custom,
        }
    }

    pub fn custom_mut(&mut self) -> &mut CustomMap {
        match self {
            CatalogRecord::Uid(u) => &mut u.custom,
            CatalogRecord::TsMeta(t) => &mut t.custom,
            CatalogRecord::Annotation(a) => &mut a.custom,
        }
    }

    /// Set the version and mirror it into the custom map.
    pub fn set_version(&mut self, version: i64) {
        match self {
            CatalogRecord::Uid(u) => u.version = version,
            CatalogRecord::TsMeta(t) => t.version = version,
            CatalogRecord::Annotation(a) => a.version = version,
        }
        self.custom_mut()
            .insert(VERSION_KEY.to_string(), version.to_string());
    }

    /// Mirror the primary key into the custom map.
    pub fn echo_pk(&mut self) {
        if let Some(pk) = self.pk() {
            self.custom_mut().insert(PK_KEY.to_string(), pk);
        }
    }

    pub fn set_timestamps(&mut self, created: i64, last_update: i64) {
        match self {
            CatalogRecord::Uid(u) => {
                u.created = created;
                u.last_update = last_update;
            }
            CatalogRecord::TsMeta(t) => {
                t.created = created;
                t.last_update = last_update;
            }
            CatalogRecord::Annotation(a) => {
                a.created = created;
                a.last_update = last_update;
            }
        }
    }

    /// Field equality ignoring bookkeeping: version, timestamps, reserved
    /// custom keys, assigned primary keys and denormalized names.
    #[must_use]
    pub fn content_eq(&self, other: &CatalogRecord) -> bool {
        self.normalized() == other.normalized()
    }

    fn normalized(&self) -> CatalogRecord {
        let mut copy = self.clone();
        match &mut copy {
            CatalogRecord::Uid(_) => {}
            CatalogRecord::TsMeta(t) => {
                t.fqnid = None;
                t.fqn.clear();
                t.metric = UidMeta::reference(t.metric.uid_type, &t.metric.uid);
                for tag in t.tags.iter_mut() {
                    *tag = UidMeta::reference(tag.uid_type, &tag.uid);
                }
            }
            CatalogRecord::Annotation(a) => {
                a.annid = None;
            }
        }
        copy.set_timestamps(0, 0);
        match &mut copy {
            CatalogRecord::Uid(u) => u.version = 0,
            CatalogRecord::TsMeta(t) => t.version = 0,
            CatalogRecord::Annotation(a) => a.version = 0,
        }
        let custom = copy.custom_mut();
        custom.remove(VERSION_KEY);
        custom.remove(PK_KEY);
        copy
    }
}

/// A change pushed to the primary store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Propagation {
    /// Idempotent insert-or-replace of the full record
    Upsert(CatalogRecord),
    /// Removal by natural key
    Delete { table: CatalogTable, key: String },
}

impl Propagation {
    #[must_use]
    pub fn table(&self) -> CatalogTable {
        match self {
            Propagation::Upsert(r) => r.table(),
            Propagation::Delete { table, .. } => *table,
        }
    }

    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Propagation::Upsert(r) => r.natural_key(),
            Propagation::Delete { key, .. } => key.clone(),
        }
    }
}
