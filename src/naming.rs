//! Execution unit naming.
//!
//! A merchant maps to one canonical unit name; when that name belongs to some
//! other merchant the orchestrator walks the versioned candidates `-v2`, `-v3`
//! and so on.

/// Cloud Run job names, and the local backend by convention, cap at 63 chars.
pub const MAX_UNIT_NAME_LEN: usize = 63;

const UNIT_PREFIX: &str = "shopify-";
const SHOP_SUFFIX: &str = ".myshopify.com";
/// Room kept for a `-vNNN` suffix; `max_unit_name_versions` tops out at 100.
const VERSION_SUFFIX_RESERVE: usize = 5;

/// Deterministic base unit name for a merchant.
///
/// ```
/// use backfill_orchestrator::naming::canonical_unit_name;
/// assert_eq!(canonical_unit_name("a.myshopify.com"), "shopify-a");
/// assert_eq!(canonical_unit_name("My_Store.myshopify.com"), "shopify-my-store");
/// ```
pub fn canonical_unit_name(merchant: &str) -> String {
    let lowered = merchant.trim().to_ascii_lowercase();
    let shop = lowered.strip_suffix(SHOP_SUFFIX).unwrap_or(&lowered);

    let mut sanitized = String::with_capacity(shop.len());
    for c in shop.chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && sanitized.ends_with('-') {
            continue;
        }
        sanitized.push(c);
    }
    let sanitized = sanitized.trim_matches('-');

    let mut name = if sanitized.starts_with(UNIT_PREFIX) {
        sanitized.to_string()
    } else if sanitized.is_empty() {
        "shopify".to_string()
    } else {
        format!("{UNIT_PREFIX}{sanitized}")
    };

    let budget = MAX_UNIT_NAME_LEN - VERSION_SUFFIX_RESERVE;
    if name.len() > budget {
        name.truncate(budget);
        while name.ends_with('-') {
            name.pop();
        }
    }
    name
}

/// Candidate `version` of `base`; version 1 is the base itself.
pub fn versioned_unit_name(base: &str, version: u32) -> String {
    if version <= 1 {
        base.to_string()
    } else {
        format!("{base}-v{version}")
    }
}

/// Ordered candidates for `merchant`, starting with a previously resolved
/// name when one is known.
pub fn unit_name_candidates(
    merchant: &str,
    previous: Option<&str>,
    max_versions: u32,
) -> Vec<String> {
    let base = canonical_unit_name(merchant);
    let mut candidates = Vec::with_capacity(max_versions as usize + 1);
    if let Some(previous) = previous {
        candidates.push(previous.to_string());
    }
    for version in 1..=max_versions.max(1) {
        let candidate = versioned_unit_name(&base, version);
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }
    candidates
}
