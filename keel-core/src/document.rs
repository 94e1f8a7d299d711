//! Resource document model
//!
//! A [`ResourceDocument`] is a sparse set of Linux resource controls, grouped
//! in four sections (`blockIO`, `cpu`, `memory`, `pids`). Every field is
//! independently optional: an unset field is never the same as zero.
//!
//! Fields are addressed through [`FieldId`], whose descriptors live in one
//! ordered table ([`FIELDS`]). That order is the canonical serialization order.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Top-level document section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Section {
    /// Block I/O controls
    BlockIo,
    /// CPU and cpuset controls
    Cpu,
    /// Memory controls
    Memory,
    /// Process-count controls
    Pids,
}

impl Section {
    /// All sections, in canonical order
    pub const ALL: [Self; 4] = [Self::BlockIo, Self::Cpu, Self::Memory, Self::Pids];

    /// Key of this section in the canonical document
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Self::BlockIo => "blockIO",
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Pids => "pids",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// How a field's raw value is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Unsigned base-10 integer
    Numeric,
    /// Kernel cpu/node list such as `0-3,8`
    CpuList,
}

/// Typed identifier of a document field.
///
/// Variants are declared in canonical order; `FieldId as usize` indexes
/// [`FIELDS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldId {
    /// `blockIO.weight`
    BlockIoWeight,
    /// `cpu.period`
    CpuPeriod,
    /// `cpu.quota`
    CpuQuota,
    /// `cpu.share`
    CpuShare,
    /// `cpu.realtimePeriod`
    CpuRealtimePeriod,
    /// `cpu.realtimeRuntime`
    CpuRealtimeRuntime,
    /// `cpu.cpus`
    CpusetCpus,
    /// `cpu.mems`
    CpusetMems,
    /// `memory.kernel`
    MemoryKernel,
    /// `memory.kernelTCP`
    MemoryKernelTcp,
    /// `memory.limit`
    MemoryLimit,
    /// `memory.reservation`
    MemoryReservation,
    /// `memory.swap`
    MemorySwap,
    /// `pids.limit`
    PidsLimit,
}

/// Static description of one document field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Field identifier
    pub id: FieldId,
    /// Section the field lives in
    pub section: Section,
    /// Key inside the section
    pub key: &'static str,
    /// Command-line option name
    pub option: &'static str,
    /// Value interpretation
    pub kind: FieldKind,
    /// One-line description
    pub help: &'static str,
}

const fn descriptor(
    id: FieldId,
    section: Section,
    key: &'static str,
    option: &'static str,
    kind: FieldKind,
    help: &'static str,
) -> FieldDescriptor {
    FieldDescriptor {
        id,
        section,
        key,
        option,
        kind,
        help,
    }
}

/// Every field, in canonical order
pub static FIELDS: [FieldDescriptor; 14] = {
    use FieldKind::{CpuList, Numeric};
    use Section::{BlockIo, Cpu, Memory, Pids};
    [
        descriptor(
            FieldId::BlockIoWeight,
            BlockIo,
            "weight",
            "blkio-weight",
            Numeric,
            "Specifies per cgroup weight",
        ),
        descriptor(
            FieldId::CpuPeriod,
            Cpu,
            "period",
            "cpu-period",
            Numeric,
            "CPU CFS period to be used for hardcapping",
        ),
        descriptor(FieldId::CpuQuota, Cpu, "quota", "cpu-quota", Numeric, "CPU CFS hardcap limit"),
        descriptor(FieldId::CpuShare, Cpu, "share", "cpu-share", Numeric, "CPU shares"),
        descriptor(
            FieldId::CpuRealtimePeriod,
            Cpu,
            "realtimePeriod",
            "cpu-rt-period",
            Numeric,
            "CPU realtime period to be used for hardcapping",
        ),
        descriptor(
            FieldId::CpuRealtimeRuntime,
            Cpu,
            "realtimeRuntime",
            "cpu-rt-runtime",
            Numeric,
            "CPU realtime hardcap limit",
        ),
        descriptor(FieldId::CpusetCpus, Cpu, "cpus", "cpuset-cpus", CpuList, "CPU(s) to use"),
        descriptor(
            FieldId::CpusetMems,
            Cpu,
            "mems",
            "cpuset-mems",
            CpuList,
            "Memory node(s) to use",
        ),
        descriptor(
            FieldId::MemoryKernel,
            Memory,
            "kernel",
            "kernel-memory",
            Numeric,
            "Kernel memory limit",
        ),
        descriptor(
            FieldId::MemoryKernelTcp,
            Memory,
            "kernelTCP",
            "kernel-memory-tcp",
            Numeric,
            "Kernel memory limit for tcp buffer",
        ),
        descriptor(FieldId::MemoryLimit, Memory, "limit", "memory", Numeric, "Memory limit"),
        descriptor(
            FieldId::MemoryReservation,
            Memory,
            "reservation",
            "memory-reservation",
            Numeric,
            "Memory reservation or soft_limit",
        ),
        descriptor(
            FieldId::MemorySwap,
            Memory,
            "swap",
            "memory-swap",
            Numeric,
            "Total memory usage",
        ),
        descriptor(
            FieldId::PidsLimit,
            Pids,
            "limit",
            "pids-limit",
            Numeric,
            "Maximum number of pids allowed in the container",
        ),
    ]
};

impl FieldId {
    /// All fields, in canonical order
    pub const ALL: [Self; 14] = [
        Self::BlockIoWeight,
        Self::CpuPeriod,
        Self::CpuQuota,
        Self::CpuShare,
        Self::CpuRealtimePeriod,
        Self::CpuRealtimeRuntime,
        Self::CpusetCpus,
        Self::CpusetMems,
        Self::MemoryKernel,
        Self::MemoryKernelTcp,
        Self::MemoryLimit,
        Self::MemoryReservation,
        Self::MemorySwap,
        Self::PidsLimit,
    ];

    /// Descriptor of this field
    #[must_use]
    pub fn descriptor(self) -> &'static FieldDescriptor {
        &FIELDS[self as usize]
    }

    /// Section this field belongs to
    #[must_use]
    pub fn section(self) -> Section {
        self.descriptor().section
    }

    /// Key inside its section
    #[must_use]
    pub fn key(self) -> &'static str {
        self.descriptor().key
    }

    /// Value interpretation
    #[must_use]
    pub fn kind(self) -> FieldKind {
        self.descriptor().kind
    }

    /// Look up a field by command-line option name (`cpu-quota`)
    #[must_use]
    pub fn from_option(option: &str) -> Option<Self> {
        FIELDS.iter().find(|d| d.option == option).map(|d| d.id)
    }

    /// Look up a field by section and key (`cpu`, `quota`)
    #[must_use]
    pub fn from_key(section: Section, key: &str) -> Option<Self> {
        FIELDS
            .iter()
            .find(|d| d.section == section && d.key == key)
            .map(|d| d.id)
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.section(), self.key())
    }
}

/// Value of a set field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Numeric field value
    Number(u64),
    /// Cpuset list value
    CpuList(String),
}

impl FieldValue {
    /// Numeric value, if this is a numeric field
    #[must_use]
    pub const fn as_number(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::CpuList(_) => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::CpuList(list) => f.write_str(list),
        }
    }
}

/// `blockIO` section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockIoResources {
    #[serde(default, deserialize_with = "lenient_u64", skip_serializing_if = "Option::is_none")]
    weight: Option<u64>,
}

/// `cpu` section, including the cpuset lists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CpuResources {
    #[serde(default, deserialize_with = "lenient_u64", skip_serializing_if = "Option::is_none")]
    period: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64", skip_serializing_if = "Option::is_none")]
    quota: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64", skip_serializing_if = "Option::is_none")]
    share: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64", skip_serializing_if = "Option::is_none")]
    realtime_period: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64", skip_serializing_if = "Option::is_none")]
    realtime_runtime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cpus: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mems: Option<String>,
}

/// `memory` section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryResources {
    #[serde(default, deserialize_with = "lenient_u64", skip_serializing_if = "Option::is_none")]
    kernel: Option<u64>,
    #[serde(
        default,
        rename = "kernelTCP",
        deserialize_with = "lenient_u64",
        skip_serializing_if = "Option::is_none"
    )]
    kernel_tcp: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64", skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64", skip_serializing_if = "Option::is_none")]
    reservation: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64", skip_serializing_if = "Option::is_none")]
    swap: Option<u64>,
}

/// `pids` section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PidsResources {
    #[serde(default, deserialize_with = "lenient_u64", skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
}

/// Sparse, immutable set of resource controls for one update.
///
/// Only the builder ([`ResourceDocument::with`]) and the codec construct
/// documents, and both validate every value they store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceDocument {
    #[serde(rename = "blockIO", default, skip_serializing_if = "Option::is_none")]
    block_io: Option<BlockIoResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cpu: Option<CpuResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    memory: Option<MemoryResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pids: Option<PidsResources>,
}

impl ResourceDocument {
    /// Empty document
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy with `field` set to `value`
    ///
    /// # Errors
    /// Returns [`Error::Validation`] if the value kind does not match the
    /// field or a cpu list is malformed
    pub fn with(mut self, field: FieldId, value: FieldValue) -> Result<Self> {
        match (field.kind(), value) {
            (FieldKind::Numeric, FieldValue::Number(n)) => {
                *self.number_slot(field) = Some(n);
            }
            (FieldKind::CpuList, FieldValue::CpuList(list)) => {
                validate_cpu_list(&list).map_err(|m| Error::validation(field.to_string(), m))?;
                *self.list_slot(field) = Some(list);
            }
            (FieldKind::Numeric, FieldValue::CpuList(_)) => {
                return Err(Error::validation(field.to_string(), "expected a number"));
            }
            (FieldKind::CpuList, FieldValue::Number(_)) => {
                return Err(Error::validation(field.to_string(), "expected a cpu list"));
            }
        }
        Ok(self)
    }

    /// Value of `field`, if set
    #[must_use]
    pub fn get(&self, field: FieldId) -> Option<FieldValue> {
        let cpu = self.cpu.as_ref();
        let memory = self.memory.as_ref();
        match field {
            FieldId::BlockIoWeight => {
                self.block_io.as_ref().and_then(|b| b.weight).map(FieldValue::Number)
            }
            FieldId::CpuPeriod => cpu.and_then(|c| c.period).map(FieldValue::Number),
            FieldId::CpuQuota => cpu.and_then(|c| c.quota).map(FieldValue::Number),
            FieldId::CpuShare => cpu.and_then(|c| c.share).map(FieldValue::Number),
            FieldId::CpuRealtimePeriod => {
                cpu.and_then(|c| c.realtime_period).map(FieldValue::Number)
            }
            FieldId::CpuRealtimeRuntime => {
                cpu.and_then(|c| c.realtime_runtime).map(FieldValue::Number)
            }
            FieldId::CpusetCpus => cpu.and_then(|c| c.cpus.clone()).map(FieldValue::CpuList),
            FieldId::CpusetMems => cpu.and_then(|c| c.mems.clone()).map(FieldValue::CpuList),
            FieldId::MemoryKernel => memory.and_then(|m| m.kernel).map(FieldValue::Number),
            FieldId::MemoryKernelTcp => memory.and_then(|m| m.kernel_tcp).map(FieldValue::Number),
            FieldId::MemoryLimit => memory.and_then(|m| m.limit).map(FieldValue::Number),
            FieldId::MemoryReservation => {
                memory.and_then(|m| m.reservation).map(FieldValue::Number)
            }
            FieldId::MemorySwap => memory.and_then(|m| m.swap).map(FieldValue::Number),
            FieldId::PidsLimit => self.pids.as_ref().and_then(|p| p.limit).map(FieldValue::Number),
        }
    }

    /// Numeric value of `field`, if set
    #[must_use]
    pub fn number(&self, field: FieldId) -> Option<u64> {
        self.get(field).and_then(|v| v.as_number())
    }

    /// Whether `field` is set
    #[must_use]
    pub fn contains(&self, field: FieldId) -> bool {
        self.get(field).is_some()
    }

    /// Set fields in canonical order
    pub fn fields(&self) -> impl Iterator<Item = (FieldId, FieldValue)> + '_ {
        FieldId::ALL
            .into_iter()
            .filter_map(|id| self.get(id).map(|value| (id, value)))
    }

    /// Whether no field is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields().next().is_none()
    }

    /// Check the invariants that serde cannot express
    ///
    /// # Errors
    /// Returns [`Error::Validation`] naming the first malformed field
    pub fn validate(&self) -> Result<()> {
        for (field, value) in self.fields() {
            if let FieldValue::CpuList(list) = value {
                validate_cpu_list(&list).map_err(|m| Error::validation(field.to_string(), m))?;
            }
        }
        Ok(())
    }

    /// Drop sections that carry no set field
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.block_io.as_ref().is_some_and(|s| *s == BlockIoResources::default()) {
            self.block_io = None;
        }
        if self.cpu.as_ref().is_some_and(|s| *s == CpuResources::default()) {
            self.cpu = None;
        }
        if self.memory.as_ref().is_some_and(|s| *s == MemoryResources::default()) {
            self.memory = None;
        }
        if self.pids.as_ref().is_some_and(|s| *s == PidsResources::default()) {
            self.pids = None;
        }
        self
    }

    fn number_slot(&mut self, field: FieldId) -> &mut Option<u64> {
        match field {
            FieldId::BlockIoWeight => {
                &mut self.block_io.get_or_insert_with(Default::default).weight
            }
            FieldId::CpuPeriod => &mut self.cpu.get_or_insert_with(Default::default).period,
            FieldId::CpuQuota => &mut self.cpu.get_or_insert_with(Default::default).quota,
            FieldId::CpuShare => &mut self.cpu.get_or_insert_with(Default::default).share,
            FieldId::CpuRealtimePeriod => {
                &mut self.cpu.get_or_insert_with(Default::default).realtime_period
            }
            FieldId::CpuRealtimeRuntime => {
                &mut self.cpu.get_or_insert_with(Default::default).realtime_runtime
            }
            FieldId::MemoryKernel => &mut self.memory.get_or_insert_with(Default::default).kernel,
            FieldId::MemoryKernelTcp => {
                &mut self.memory.get_or_insert_with(Default::default).kernel_tcp
            }
            FieldId::MemoryLimit => &mut self.memory.get_or_insert_with(Default::default).limit,
            FieldId::MemoryReservation => {
                &mut self.memory.get_or_insert_with(Default::default).reservation
            }
            FieldId::MemorySwap => &mut self.memory.get_or_insert_with(Default::default).swap,
            FieldId::PidsLimit => &mut self.pids.get_or_insert_with(Default::default).limit,
            FieldId::CpusetCpus | FieldId::CpusetMems => {
                unreachable!("{field} is not numeric")
            }
        }
    }

    fn list_slot(&mut self, field: FieldId) -> &mut Option<String> {
        let cpu = self.cpu.get_or_insert_with(Default::default);
        match field {
            FieldId::CpusetCpus => &mut cpu.cpus,
            FieldId::CpusetMems => &mut cpu.mems,
            _ => unreachable!("{field} is not a cpu list"),
        }
    }
}

/// Check a kernel cpu/node list: comma separated `N`, `N-M` or `N-M:A/B`
/// items with `N <= M`. The empty list is valid.
///
/// # Errors
/// Returns a description of the first malformed item
pub fn validate_cpu_list(list: &str) -> std::result::Result<(), String> {
    let list = list.trim_end_matches('\n');
    if list.is_empty() {
        return Ok(());
    }

    let number = |s: &str| -> std::result::Result<u32, String> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("{s:?} is not a cpu number"));
        }
        s.parse::<u32>().map_err(|e| format!("{s:?}: {e}"))
    };

    for item in list.split(',') {
        let (range, stride) = match item.split_once(':') {
            Some((range, stride)) => (range, Some(stride)),
            None => (item, None),
        };

        match range.split_once('-') {
            Some((lo, hi)) => {
                if number(lo)? > number(hi)? {
                    return Err(format!("range {range:?} is reversed"));
                }
            }
            None if stride.is_some() => {
                return Err(format!("stride needs a range in {item:?}"));
            }
            None => {
                number(range)?;
            }
        }

        if let Some(stride) = stride {
            let (used, group) = stride
                .split_once('/')
                .ok_or_else(|| format!("malformed stride in {item:?}"))?;
            let (used, group) = (number(used)?, number(group)?);
            if used == 0 || group == 0 || used > group {
                return Err(format!("invalid stride in {item:?}"));
            }
        }
    }

    Ok(())
}

// Hand-authored files sometimes quote numbers; both forms are accepted, but
// only unsigned base-10 digits.
fn lenient_u64<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => parse_unsigned(&s).map(Some).map_err(serde::de::Error::custom),
    }
}

/// Parse an unsigned base-10 integer: digits only, no sign, no whitespace
///
/// # Errors
/// Returns a description of why the text is not a valid number
pub fn parse_unsigned(raw: &str) -> std::result::Result<u64, String> {
    if raw.is_empty() {
        return Err("empty value".to_string());
    }
    if !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("{raw:?} is not an unsigned base-10 integer"));
    }
    raw.parse::<u64>().map_err(|e| format!("{raw:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_table_matches_field_order() {
        for (index, id) in FieldId::ALL.iter().enumerate() {
            assert_eq!(FIELDS[index].id, *id);
            assert_eq!(*id as usize, index);
        }
        assert!(FieldId::ALL.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn option_and_key_lookup() {
        assert_eq!(FieldId::from_option("cpu-quota"), Some(FieldId::CpuQuota));
        assert_eq!(FieldId::from_option("memory"), Some(FieldId::MemoryLimit));
        assert_eq!(FieldId::from_option("pids-limit"), Some(FieldId::PidsLimit));
        assert_eq!(FieldId::from_option("cpu-shares"), None);

        assert_eq!(FieldId::from_key(Section::Pids, "limit"), Some(FieldId::PidsLimit));
        assert_eq!(FieldId::from_key(Section::Memory, "limit"), Some(FieldId::MemoryLimit));
        assert_eq!(FieldId::from_key(Section::Cpu, "cpus"), Some(FieldId::CpusetCpus));
        assert_eq!(FieldId::MemoryKernelTcp.to_string(), "memory.kernelTCP");
    }

    #[test]
    fn unset_is_not_zero() {
        let doc = ResourceDocument::new()
            .with(FieldId::CpuQuota, FieldValue::Number(0))
            .unwrap();
        assert_eq!(doc.number(FieldId::CpuQuota), Some(0));
        assert_eq!(doc.number(FieldId::CpuPeriod), None);
        assert!(!doc.contains(FieldId::PidsLimit));
    }

    #[test]
    fn fields_iterate_in_canonical_order() {
        let doc = ResourceDocument::new()
            .with(FieldId::PidsLimit, FieldValue::Number(10))
            .unwrap()
            .with(FieldId::CpusetCpus, FieldValue::CpuList("0-1".into()))
            .unwrap()
            .with(FieldId::BlockIoWeight, FieldValue::Number(500))
            .unwrap();

        let order: Vec<FieldId> = doc.fields().map(|(id, _)| id).collect();
        assert_eq!(
            order,
            vec![FieldId::BlockIoWeight, FieldId::CpusetCpus, FieldId::PidsLimit]
        );
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let err = ResourceDocument::new()
            .with(FieldId::CpuQuota, FieldValue::CpuList("1".into()))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        assert!(ResourceDocument::new()
            .with(FieldId::CpusetMems, FieldValue::Number(1))
            .is_err());
    }

    #[test]
    fn cpu_list_grammar() {
        for ok in ["", "0", "0-3", "0-3,8", "1,3,5-7", "0-15:2/4", "0\n"] {
            assert!(validate_cpu_list(ok).is_ok(), "{ok:?} should be valid");
        }
        for bad in ["a", "3-1", "1,,2", "-1", "0-", "1:2/4", "0-7:0/4", "0-7:5/4", " 1"] {
            assert!(validate_cpu_list(bad).is_err(), "{bad:?} should be invalid");
        }
    }

    #[test]
    fn parse_unsigned_rejects_non_digits() {
        assert_eq!(parse_unsigned("100000"), Ok(100_000));
        for bad in ["", "-1", "+1", " 1", "1 ", "1e3", "0x10", "18446744073709551616"] {
            assert!(parse_unsigned(bad).is_err(), "{bad:?} should be invalid");
        }
    }

    #[test]
    fn normalized_drops_empty_sections() {
        let doc: ResourceDocument =
            serde_json::from_str(r#"{"cpu": {}, "pids": {"limit": 3}}"#).unwrap();
        let expected = ResourceDocument::new()
            .with(FieldId::PidsLimit, FieldValue::Number(3))
            .unwrap();
        assert_eq!(doc.normalized(), expected);
    }
}
