use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::infrared::server::Backend;

/// Result of a successful lookup.
#[derive(Debug, Clone)]
pub struct Match {
    pub backend: Arc<Backend>,
    pub matched_domain: String,
}

/// Maps `(gateway id, requested host)` to a backend. The table is an
/// immutable snapshot swapped on reload, so lookups never block.
pub struct Router {
    table: ArcSwap<RoutingTable>,
}

#[derive(Default)]
struct RoutingTable {
    // Registration order; earlier entries win ties.
    entries: Vec<Arc<Backend>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Router {
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        let r = Self {
            table: ArcSwap::from_pointee(RoutingTable::default()),
        };
        r.update(backends);
        r
    }

    pub fn update(&self, backends: Vec<Arc<Backend>>) {
        self.table
            .store(Arc::new(RoutingTable { entries: backends }));
    }

    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.table.load().entries.clone()
    }

    pub fn resolve(&self, gateway_id: &str, host: &str) -> Option<Match> {
        let host = host.trim().to_ascii_lowercase();
        if host.is_empty() {
            return None;
        }

        let table = self.table.load();
        let mut best: Option<(usize, &Arc<Backend>, &str)> = None;
        for backend in &table.entries {
            if !backend.serves_gateway(gateway_id) {
                continue;
            }
            for domain in &backend.domains {
                let Some(score) = similarity(domain, &host) else {
                    continue;
                };
                if best.is_none_or(|(s, _, _)| score > s) {
                    best = Some((score, backend, domain));
                }
            }
        }

        best.map(|(_, backend, domain)| Match {
            backend: Arc::clone(backend),
            matched_domain: domain.to_string(),
        })
    }
}

/// Compares `pattern` and `host` from the right. Returns the number of equal
/// characters before the first divergence if that divergence sits on a `*`
/// in the pattern; an exact match scores one more than its length.
fn similarity(pattern: &str, host: &str) -> Option<usize> {
    if pattern == host {
        return Some(host.chars().count() + 1);
    }
    let mut p = pattern.chars().rev();
    let mut h = host.chars().rev();
    let mut score = 0;
    loop {
        match (p.next(), h.next()) {
            (Some(pc), Some(hc)) if pc == hc && pc != '*' => score += 1,
            (Some('*'), _) => return Some(score),
            _ => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrared::server::tests::backend;

    fn router(entries: &[(&str, &[&str])]) -> Router {
        Router::new(
            entries
                .iter()
                .map(|(id, domains)| Arc::new(backend(id, domains, "127.0.0.1:25566")))
                .collect(),
        )
    }

    fn resolve(r: &Router, host: &str) -> Option<String> {
        r.resolve("default", host).map(|m| m.backend.id.clone())
    }

    #[test]
    fn routing_is_deterministic() {
        let r = router(&[("A", &["*.example.com"]), ("B", &["mc.example.com"])]);
        assert_eq!(resolve(&r, "mc.example.com").as_deref(), Some("B"));
        assert_eq!(resolve(&r, "play.example.com").as_deref(), Some("A"));
        assert_eq!(resolve(&r, "other.net"), None);

        let m = r.resolve("default", "MC.Example.com").unwrap();
        assert_eq!(m.matched_domain, "mc.example.com");
    }

    #[test]
    fn similarity_scores() {
        assert_eq!(similarity("mc.example.com", "mc.example.com"), Some(15));
        assert_eq!(similarity("*.example.com", "play.example.com"), Some(12));
        assert_eq!(similarity("*.example.com", "example.com"), None);
        assert_eq!(similarity("*example.com", "example.com"), Some(11));
        assert_eq!(similarity("*", "anything"), Some(0));
        assert_eq!(similarity("mc.*.com", "mc.eu.com"), Some(4));
        assert_eq!(similarity("example.com", "mc.example.com"), None);
    }

    #[test]
    fn longer_suffix_beats_shorter() {
        let r = router(&[("all", &["*"]), ("eu", &["*.eu.example.com"])]);
        assert_eq!(resolve(&r, "a.eu.example.com").as_deref(), Some("eu"));
        assert_eq!(resolve(&r, "a.us.example.com").as_deref(), Some("all"));
    }

    #[test]
    fn ties_go_to_the_first_registered() {
        let r = router(&[("first", &["*.example.com"]), ("second", &["*.example.com"])]);
        assert_eq!(resolve(&r, "x.example.com").as_deref(), Some("first"));
    }

    #[test]
    fn only_eligible_backends_are_considered() {
        let mut internal = backend("internal", &["mc.example.com"], "x:1");
        internal.gateways = vec!["lan".into()];
        let public = backend("public", &["*"], "x:2");
        let r = Router::new(vec![Arc::new(internal), Arc::new(public)]);

        assert_eq!(
            r.resolve("lan", "mc.example.com").unwrap().backend.id,
            "internal"
        );
        assert_eq!(
            r.resolve("wan", "mc.example.com").unwrap().backend.id,
            "public"
        );
    }

    #[test]
    fn update_swaps_the_table() {
        let r = router(&[("old", &["mc.example.com"])]);
        assert_eq!(resolve(&r, "mc.example.com").as_deref(), Some("old"));
        r.update(vec![Arc::new(backend("new", &["mc.example.com"], "x:1"))]);
        assert_eq!(resolve(&r, "mc.example.com").as_deref(), Some("new"));
        assert_eq!(resolve(&r, ""), None);
    }
}
