//! Powerman host-list expansion.
//!
//! Powerman compresses node sets in its status output: `radia[1-5]`,
//! `n[01-03,7]`, `gw,n[1-2]`. Expansion preserves zero padding, so
//! `n[01-03]` yields `n01 n02 n03`.

/// Upper bound on names produced from one host list.
const MAX_EXPANDED_HOSTS: usize = 65_536;

/// Expands a host list into individual names.
///
/// Returns `None` for malformed lists (unbalanced brackets, bad ranges, or
/// an expansion larger than the sanity bound).
#[must_use]
pub fn expand(list: &str) -> Option<Vec<String>> {
    let mut hosts = Vec::new();
    for item in split_top_level(list)? {
        if item.is_empty() {
            continue;
        }
        expand_item(item, &mut hosts)?;
        if hosts.len() > MAX_EXPANDED_HOSTS {
            return None;
        }
    }
    Some(hosts)
}

/// True when `list` names `host` exactly.
#[must_use]
pub fn contains(list: &str, host: &str) -> bool {
    expand(list).is_some_and(|hosts| hosts.iter().any(|h| h == host))
}

/// Splits on commas that are outside brackets.
fn split_top_level(list: &str) -> Option<Vec<&str>> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, ch) in list.char_indices() {
        match ch {
            '[' => {
                if depth > 0 {
                    return None;
                }
                depth += 1;
            },
            ']' => depth = depth.checked_sub(1)?,
            ',' if depth == 0 => {
                items.push(list[start..i].trim());
                start = i + 1;
            },
            _ => {},
        }
    }
    if depth != 0 {
        return None;
    }
    items.push(list[start..].trim());
    Some(items)
}

/// Expands one item (`prefix[ranges]suffix` or a plain name).
fn expand_item(item: &str, out: &mut Vec<String>) -> Option<()> {
    let Some(open) = item.find('[') else {
        if item.contains(']') {
            return None;
        }
        out.push(item.to_string());
        return Some(());
    };
    let close = open + item[open..].find(']')?;
    let prefix = &item[..open];
    let ranges = &item[open + 1..close];
    let suffix = &item[close + 1..];

    let mut suffixes = Vec::new();
    expand_item(suffix, &mut suffixes)?;

    for range in ranges.split(',') {
        for number in expand_range(range.trim())? {
            for tail in &suffixes {
                out.push(format!("{prefix}{number}{tail}"));
                if out.len() > MAX_EXPANDED_HOSTS {
                    return None;
                }
            }
        }
    }
    Some(())
}

/// Expands `7` or `01-03` into its members, keeping the width of the low
/// bound.
fn expand_range(range: &str) -> Option<Vec<String>> {
    let (low, high) = range.split_once('-').unwrap_or((range, range));
    if low.is_empty() || !low.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if high.is_empty() || !high.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let width = low.len();
    let low: u64 = low.parse().ok()?;
    let high: u64 = high.parse().ok()?;
    if high < low || high - low >= MAX_EXPANDED_HOSTS as u64 {
        return None;
    }
    Some((low..=high).map(|n| format!("{n:0width$}")).collect())
}
