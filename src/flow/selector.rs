use tracing::trace;

use crate::flow::graph::Flow;

/// Picks the flow a fresh inbound message should trigger. Pure function over
/// the tenant's active flows; no writes, no ranking.
///
/// Keyword pass: case-insensitive substring match of each flow's keywords
/// against the message, enumeration order, first match wins. Fallback policy:
/// the first flow flagged `is_default`, unconditionally; no greeting-phrase
/// gate. Returns `None` when neither pass finds a flow.
pub fn select_flow<'a>(flows: &'a [Flow], text: &str) -> Option<&'a Flow> {
    let needle = text.to_lowercase();

    for flow in flows.iter().filter(|f| f.active) {
        if flow.keywords.iter().any(|kw| {
            let kw = kw.trim().to_lowercase();
            !kw.is_empty() && needle.contains(&kw)
        }) {
            trace!(flow = %flow.id, "keyword match");
            return Some(flow);
        }
    }

    let fallback = flows.iter().find(|f| f.active && f.is_default);
    if let Some(flow) = &fallback {
        trace!(flow = %flow.id, "no keyword match, using default flow");
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(id: &str, keywords: &[&str], is_default: bool, active: bool) -> Flow {
        Flow {
            id: id.into(),
            tenant_id: "t1".into(),
            name: id.into(),
            active,
            is_default,
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_keyword_substring_case_insensitive() {
        let flows = vec![flow("promo", &["promoção"], false, true)];
        let hit = select_flow(&flows, "Quero saber da PROMOÇÃO de hoje").unwrap();
        assert_eq!(hit.id, "promo");
    }

    #[test]
    fn test_first_match_wins_in_enumeration_order() {
        let flows = vec![
            flow("a", &["oi"], false, true),
            flow("b", &["oi"], false, true),
        ];
        assert_eq!(select_flow(&flows, "oi tudo bem").unwrap().id, "a");
    }

    #[test]
    fn test_inactive_flows_never_match() {
        let flows = vec![flow("off", &["oi"], true, false)];
        assert!(select_flow(&flows, "oi").is_none());
    }

    #[test]
    fn test_default_fallback_is_unconditional() {
        let flows = vec![
            flow("kw", &["pedido"], false, true),
            flow("default", &[], true, true),
        ];
        // arbitrary text, not a greeting, still falls back
        assert_eq!(select_flow(&flows, "xyzzy").unwrap().id, "default");
    }

    #[test]
    fn test_no_match_no_default() {
        let flows = vec![flow("kw", &["pedido"], false, true)];
        assert!(select_flow(&flows, "oi").is_none());
    }

    #[test]
    fn test_blank_keywords_ignored() {
        let flows = vec![flow("kw", &["", "  "], false, true)];
        assert!(select_flow(&flows, "anything").is_none());
    }
}
