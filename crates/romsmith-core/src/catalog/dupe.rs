use super::CatalogEntry;

/// Whether two entries come from the same source catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Locality {
    Internal,
    External,
}

/// Whether two matching entries also share their owning set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    HashOnly,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DupeClassification {
    None,
    Duplicate { locality: Locality, scope: Scope },
}

impl DupeClassification {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DupeClassification::Duplicate { .. })
    }

    pub fn locality(&self) -> Option<Locality> {
        match self {
            DupeClassification::Duplicate { locality, .. } => Some(*locality),
            DupeClassification::None => None,
        }
    }

    pub fn scope(&self) -> Option<Scope> {
        match self {
            DupeClassification::Duplicate { scope, .. } => Some(*scope),
            DupeClassification::None => None,
        }
    }
}

/// Classify the duplicate relationship between two entries.
///
/// Every algorithm present on both sides must agree and at least one must be
/// shared; a single disagreeing digest vetoes the match. Known sizes must
/// also agree.
pub fn classify(a: &CatalogEntry, b: &CatalogEntry) -> DupeClassification {
    if a.kind != b.kind {
        return DupeClassification::None;
    }

    if let (Some(sa), Some(sb)) = (a.size, b.size) {
        if sa != sb {
            return DupeClassification::None;
        }
    }

    let mut shared = 0;
    for pair in a.hash_pairs(b) {
        if let (Some(ha), Some(hb)) = pair {
            if ha != hb {
                return DupeClassification::None;
            }
            shared += 1;
        }
    }
    if shared == 0 {
        return DupeClassification::None;
    }

    let locality = if a.source_id == b.source_id {
        Locality::Internal
    } else {
        Locality::External
    };
    let scope = if a.set_name == b.set_name {
        Scope::All
    } else {
        Scope::HashOnly
    };

    DupeClassification::Duplicate { locality, scope }
}

pub fn classify_optional(a: Option<&CatalogEntry>, b: Option<&CatalogEntry>) -> DupeClassification {
    match (a, b) {
        (Some(a), Some(b)) => classify(a, b),
        _ => DupeClassification::None,
    }
}
