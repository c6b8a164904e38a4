//! Compute-resource arithmetic.
//!
//! Quantities are fixed-point (milli-units in an `i64`) so that cap checks
//! and fair-share accounting are exact. A `ResourceList` maps resource names
//! (`cpu`, `memory`, ...) to quantities; a `ResourceListByPriority` layers
//! lists by priority so preemption can compute what evicting everything at
//! or below a priority would free.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SchedulingError;

/// A non-negative scalar quantity of some resource, in milli-units.
///
/// `Quantity::from_str` accepts plain decimals (`"32"`, `"0.5"`), a milli
/// suffix (`"500m"`) and binary suffixes (`"128Mi"`, `"16Gi"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Quantity(i64);

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);

    pub fn from_millis(millis: i64) -> Self {
        Quantity(millis)
    }

    /// Whole units, e.g. `Quantity::from_units(32)` is 32 cpu.
    pub fn from_units(units: i64) -> Self {
        Quantity(units * 1000)
    }

    pub fn millis(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Subtraction that fails rather than going negative.
    pub fn checked_sub(self, other: Quantity) -> Option<Quantity> {
        if other.0 > self.0 {
            None
        } else {
            Some(Quantity(self.0 - other.0))
        }
    }

    /// Subtraction clamped at zero. Distinct from [`Quantity::checked_sub`]:
    /// callers choose explicitly whether underflow is an error.
    pub fn saturating_sub(self, other: Quantity) -> Quantity {
        Quantity((self.0 - other.0).max(0))
    }

    pub fn scale(self, factor: f64) -> Quantity {
        Quantity((self.0 as f64 * factor).round() as i64)
    }

    /// Round down to a multiple of `resolution`. Used for index keys.
    pub fn quantize_down(self, resolution: Quantity) -> Quantity {
        if resolution.0 <= 0 {
            return self;
        }
        Quantity(self.0 - self.0 % resolution.0)
    }
}

impl std::ops::Add for Quantity {
    type Output = Quantity;

    fn add(self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

impl FromStr for Quantity {
    type Err = SchedulingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || SchedulingError::InvalidArgument {
            name: "quantity".into(),
            message: format!("cannot parse {s:?} as a resource quantity"),
        };
        if s.is_empty() {
            return Err(invalid());
        }
        if let Some(millis) = s.strip_suffix('m') {
            let millis: i64 = millis.parse().map_err(|_| invalid())?;
            if millis < 0 {
                return Err(invalid());
            }
            return Ok(Quantity(millis));
        }
        for (suffix, factor) in [("Ki", 1i64 << 10), ("Mi", 1i64 << 20), ("Gi", 1i64 << 30), ("Ti", 1i64 << 40)] {
            if let Some(units) = s.strip_suffix(suffix) {
                let units: i64 = units.parse().map_err(|_| invalid())?;
                if units < 0 {
                    return Err(invalid());
                }
                return Ok(Quantity(units.saturating_mul(factor).saturating_mul(1000)));
            }
        }
        // Plain decimal with up to milli precision.
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if frac.len() > 3 || frac.chars().any(|c| !c.is_ascii_digit()) {
            return Err(invalid());
        }
        let whole: i64 = whole.parse().map_err(|_| invalid())?;
        if whole < 0 {
            return Err(invalid());
        }
        let frac_millis: i64 = if frac.is_empty() {
            0
        } else {
            format!("{frac:0<3}").parse().map_err(|_| invalid())?
        };
        Ok(Quantity(whole * 1000 + frac_millis))
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|e| D::Error::custom(format!("{e}")))
    }
}

/// A map from resource name to quantity. Absent entries are zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceList(BTreeMap<String, Quantity>);

impl ResourceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Quantity)>,
        S: Into<String>,
    {
        ResourceList(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn get(&self, resource: &str) -> Quantity {
        self.0.get(resource).copied().unwrap_or(Quantity::ZERO)
    }

    /// Whether the resource is present at all; absent differs from zero
    /// when applying defaults.
    pub fn contains(&self, resource: &str) -> bool {
        self.0.contains_key(resource)
    }

    pub fn set(&mut self, resource: impl Into<String>, quantity: Quantity) {
        self.0.insert(resource.into(), quantity);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Quantity)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn resource_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }

    pub fn is_zero(&self) -> bool {
        self.0.values().all(|q| q.is_zero())
    }

    pub fn add(&mut self, other: &ResourceList) {
        for (resource, quantity) in other.iter() {
            let entry = self.0.entry(resource.to_string()).or_insert(Quantity::ZERO);
            *entry = *entry + quantity;
        }
    }

    /// Subtraction that fails with `InsufficientResources` on underflow.
    pub fn checked_sub(&mut self, other: &ResourceList) -> Result<(), SchedulingError> {
        for (resource, quantity) in other.iter() {
            if self.get(resource).checked_sub(quantity).is_none() {
                return Err(SchedulingError::InsufficientResources {
                    resource: resource.to_string(),
                });
            }
        }
        for (resource, quantity) in other.iter() {
            let entry = self.0.entry(resource.to_string()).or_insert(Quantity::ZERO);
            *entry = entry.checked_sub(quantity).unwrap_or(Quantity::ZERO);
        }
        Ok(())
    }

    /// Subtraction clamped at zero per resource.
    pub fn saturating_sub(&mut self, other: &ResourceList) {
        for (resource, quantity) in other.iter() {
            let entry = self.0.entry(resource.to_string()).or_insert(Quantity::ZERO);
            *entry = entry.saturating_sub(quantity);
        }
    }

    pub fn scale(&self, factor: f64) -> ResourceList {
        ResourceList(self.0.iter().map(|(k, v)| (k.clone(), v.scale(factor))).collect())
    }

    /// Dominance: `self` fits within `other` iff every quantity in `self` is
    /// at most the corresponding quantity in `other`.
    pub fn fits_within(&self, other: &ResourceList) -> bool {
        self.iter().all(|(resource, quantity)| quantity <= other.get(resource))
    }

    /// Total order used to rank residual free resources: dominance where it
    /// applies, lexicographic on resource name otherwise.
    pub fn cmp_tightness(&self, other: &ResourceList) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        let self_le = self.fits_within(other);
        let other_le = other.fits_within(self);
        match (self_le, other_le) {
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
        let names: std::collections::BTreeSet<&str> =
            self.resource_names().chain(other.resource_names()).collect();
        for name in names {
            match self.get(name).cmp(&other.get(name)) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }

    /// The dominant-resource share of `self` against `total`, the key of the
    /// fair-share heap. Resources absent from `total` contribute nothing.
    pub fn dominant_share(&self, total: &ResourceList) -> f64 {
        let mut share: f64 = 0.0;
        for (resource, quantity) in self.iter() {
            let cap = total.get(resource);
            if cap.is_zero() {
                continue;
            }
            share = share.max(quantity.millis() as f64 / cap.millis() as f64);
        }
        share
    }
}

impl fmt::Display for ResourceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (resource, quantity) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{resource}={quantity}")?;
            first = false;
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

/// Resource usage layered by priority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceListByPriority(BTreeMap<i32, ResourceList>);

impl ResourceListByPriority {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, priority: i32) -> ResourceList {
        self.0.get(&priority).cloned().unwrap_or_default()
    }

    pub fn add_at(&mut self, priority: i32, resources: &ResourceList) {
        self.0.entry(priority).or_default().add(resources);
    }

    pub fn sub_at(&mut self, priority: i32, resources: &ResourceList) {
        if let Some(layer) = self.0.get_mut(&priority) {
            layer.saturating_sub(resources);
        }
    }

    /// Sum across all priorities.
    pub fn total(&self) -> ResourceList {
        let mut total = ResourceList::new();
        for layer in self.0.values() {
            total.add(layer);
        }
        total
    }

    /// What evicting every job at priority `p` or below would free.
    pub fn allocated_at_most(&self, priority: i32) -> ResourceList {
        let mut freed = ResourceList::new();
        for (p, layer) in &self.0 {
            if *p <= priority {
                freed.add(layer);
            }
        }
        freed
    }

    /// Usage by priority `p` and everything above it. Per-queue caps at a
    /// priority class bound this cumulative figure.
    pub fn allocated_at_least(&self, priority: i32) -> ResourceList {
        let mut used = ResourceList::new();
        for (p, layer) in &self.0 {
            if *p >= priority {
                used.add(layer);
            }
        }
        used
    }

    pub fn is_zero(&self) -> bool {
        self.0.values().all(|layer| layer.is_zero())
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, &ResourceList)> {
        self.0.iter().map(|(p, layer)| (*p, layer))
    }
}

impl fmt::Display for ResourceListByPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (priority, layer) in self.iter() {
            if layer.is_zero() {
                continue;
            }
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "[{priority}] {layer}")?;
            first = false;
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(units: i64) -> ResourceList {
        ResourceList::from_pairs([("cpu", Quantity::from_units(units))])
    }

    #[test]
    fn test_quantity_parsing() {
        assert_eq!("32".parse::<Quantity>().unwrap(), Quantity::from_units(32));
        assert_eq!("500m".parse::<Quantity>().unwrap(), Quantity::from_millis(500));
        assert_eq!("0.5".parse::<Quantity>().unwrap(), Quantity::from_millis(500));
        assert_eq!(
            "128Mi".parse::<Quantity>().unwrap(),
            Quantity::from_units(128 * 1024 * 1024)
        );
        assert!("".parse::<Quantity>().is_err());
        assert!("-1".parse::<Quantity>().is_err());
        assert!("1.2345".parse::<Quantity>().is_err());
    }

    #[test]
    fn test_quantity_display_round_trips() {
        for s in ["32", "500m", "0"] {
            let q: Quantity = s.parse().unwrap();
            assert_eq!(q.to_string().parse::<Quantity>().unwrap(), q);
        }
    }

    #[test]
    fn test_quantize_down() {
        let resolution = Quantity::from_units(16);
        assert_eq!(Quantity::from_units(17).quantize_down(resolution), Quantity::from_units(16));
        assert_eq!(Quantity::from_units(16).quantize_down(resolution), Quantity::from_units(16));
        assert_eq!(Quantity::from_units(15).quantize_down(resolution), Quantity::ZERO);
    }

    #[test]
    fn test_checked_sub_fails_on_underflow() {
        let mut a = cpu(1);
        let err = a.checked_sub(&cpu(2)).unwrap_err();
        assert!(matches!(err, SchedulingError::InsufficientResources { .. }));
        // Failed subtraction leaves the list untouched.
        assert_eq!(a, cpu(1));
    }

    #[test]
    fn test_saturating_sub_clamps() {
        let mut a = cpu(1);
        a.saturating_sub(&cpu(2));
        assert!(a.is_zero());
    }

    #[test]
    fn test_dominance() {
        let small = ResourceList::from_pairs([
            ("cpu", Quantity::from_units(1)),
            ("memory", Quantity::from_units(1)),
        ]);
        let large = ResourceList::from_pairs([
            ("cpu", Quantity::from_units(2)),
            ("memory", Quantity::from_units(1)),
        ]);
        assert!(small.fits_within(&large));
        assert!(!large.fits_within(&small));
        // Absent entries are zero.
        assert!(ResourceList::new().fits_within(&small));
    }

    #[test]
    fn test_cmp_tightness_prefers_dominated() {
        let tight = cpu(1);
        let loose = cpu(3);
        assert_eq!(tight.cmp_tightness(&loose), std::cmp::Ordering::Less);
        let mixed_a = ResourceList::from_pairs([
            ("cpu", Quantity::from_units(1)),
            ("memory", Quantity::from_units(4)),
        ]);
        let mixed_b = ResourceList::from_pairs([
            ("cpu", Quantity::from_units(2)),
            ("memory", Quantity::from_units(3)),
        ]);
        // Incomparable by dominance: lexicographic on resource name, cpu first.
        assert_eq!(mixed_a.cmp_tightness(&mixed_b), std::cmp::Ordering::Less);
    }

    #[test]
    fn test_dominant_share() {
        let total = ResourceList::from_pairs([
            ("cpu", Quantity::from_units(32)),
            ("memory", Quantity::from_units(256)),
        ]);
        let used = ResourceList::from_pairs([
            ("cpu", Quantity::from_units(8)),
            ("memory", Quantity::from_units(16)),
        ]);
        assert!((used.dominant_share(&total) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_layered_totals() {
        let mut pr = ResourceListByPriority::new();
        pr.add_at(0, &cpu(4));
        pr.add_at(1, &cpu(8));
        pr.add_at(2, &cpu(2));
        assert_eq!(pr.total(), cpu(14));
        assert_eq!(pr.allocated_at_most(1), cpu(12));
        assert_eq!(pr.allocated_at_most(-1), ResourceList::new());
        assert_eq!(pr.allocated_at_least(1), cpu(10));
        pr.sub_at(1, &cpu(8));
        assert_eq!(pr.total(), cpu(6));
    }
}
