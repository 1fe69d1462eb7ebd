use log::warn;
use oci_spec::distribution::Reference;

use crate::PullError;
use srmeta::{MetadataClient, MirrorRule};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullKind {
    Digest,
    Tag,
}

// expands a repository reference through the mirror policy catalogs into an
// ordered list of candidate sources, original always last. rules come from
// three policy classes: the modern digest and tag mirror sets and the legacy
// content source policy, which only ever applied to digest pulls
pub struct MirrorResolver {
    legacy: Vec<MirrorRule>,
    digest: Vec<MirrorRule>,
    tag: Vec<MirrorRule>,
}

impl MirrorResolver {
    pub fn new(legacy: Vec<MirrorRule>, digest: Vec<MirrorRule>, tag: Vec<MirrorRule>) -> Self {
        Self {
            legacy,
            digest,
            tag,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new(), Vec::new())
    }

    pub async fn load(meta: &dyn MetadataClient) -> Result<Self, PullError> {
        Ok(Self::new(
            meta.list_legacy_mirror_rules().await?,
            meta.list_digest_mirror_rules().await?,
            meta.list_tag_mirror_rules().await?,
        ))
    }

    // candidates for one reference, in policy discovery order, deduplicated
    // keeping the first, the original reference appended last
    pub fn resolve(
        &self,
        reference: &Reference,
        kind: PullKind,
    ) -> Result<Vec<Reference>, PullError> {
        // mixing the legacy policy with a modern digest mirror set is a
        // cluster configuration error, refuse rather than guess an order
        if !self.legacy.is_empty() && !self.digest.is_empty() {
            return Err(PullError::ConflictingMirrorPolicies);
        }

        let rules: &[MirrorRule] = match kind {
            PullKind::Digest if !self.digest.is_empty() => &self.digest,
            PullKind::Digest => &self.legacy,
            PullKind::Tag => &self.tag,
        };

        let source = repo_string(reference);

        let mut out: Vec<Reference> = Vec::new();
        let mut push = |candidate: Reference| {
            let key = repo_string(&candidate);
            if !out.iter().any(|r| repo_string(r) == key) {
                out.push(candidate);
            }
        };

        for rule in rules {
            let Some(suffix) = match_prefix(&rule.source, &source) else {
                continue;
            };
            for mirror in &rule.mirrors {
                let rewritten = if suffix.is_empty() {
                    mirror.clone()
                } else {
                    format!("{}/{}", mirror, suffix)
                };
                match rewritten.parse::<Reference>() {
                    Ok(candidate) => push(candidate),
                    Err(e) => {
                        // one bad mirror string doesn't break the set
                        warn!("skipping unparseable mirror {}: {:?}", rewritten, e);
                    }
                }
            }
        }

        push(reference.clone());
        Ok(out)
    }
}

// the registry exactly as the reference wrote it, so a rule source of
// docker.io matches docker.io pulls without being rewritten through the
// index.docker.io normalization
pub(crate) fn repo_string(r: &Reference) -> String {
    let registry = r.registry();
    if registry.is_empty() {
        format!("{}/{}", r.resolve_registry(), r.repository())
    } else {
        format!("{}/{}", registry, r.repository())
    }
}

// prefix match on whole path segments, never substring: source matches ref
// when equal or when ref continues with a / right after it. returns the
// remaining suffix
fn match_prefix<'a>(source: &str, reference: &'a str) -> Option<&'a str> {
    if reference == source {
        return Some("");
    }
    reference
        .strip_prefix(source)
        .and_then(|rest| rest.strip_prefix('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(source: &str, mirrors: &[&str]) -> MirrorRule {
        MirrorRule {
            source: source.to_string(),
            mirrors: mirrors.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn refs_to_strings(refs: &[Reference]) -> Vec<String> {
        refs.iter().map(repo_string).collect()
    }

    #[test]
    fn test_mirror_then_original() {
        let resolver = MirrorResolver::new(
            vec![],
            vec![rule(
                "docker.io/library",
                &["mirror.example.com/dockerio-library"],
            )],
            vec![],
        );
        let reference: Reference = "docker.io/library/busybox".parse().unwrap();
        let out = resolver.resolve(&reference, PullKind::Digest).unwrap();
        assert_eq!(
            refs_to_strings(&out),
            vec![
                "mirror.example.com/dockerio-library/busybox",
                "docker.io/library/busybox",
            ]
        );
    }

    #[test]
    fn test_segment_prefix_not_substring() {
        let resolver = MirrorResolver::new(
            vec![],
            vec![rule("example.com/team", &["mirror.example.com/team"])],
            vec![],
        );
        // team2 must not match the team rule
        let reference: Reference = "example.com/team2/app".parse().unwrap();
        let out = resolver.resolve(&reference, PullKind::Digest).unwrap();
        assert_eq!(refs_to_strings(&out), vec!["example.com/team2/app"]);
    }

    #[test]
    fn test_registry_wide_rule() {
        let resolver = MirrorResolver::new(
            vec![],
            vec![rule("quay.example.com", &["mirror.example.com/quay"])],
            vec![],
        );
        let reference: Reference = "quay.example.com/ns/app".parse().unwrap();
        let out = resolver.resolve(&reference, PullKind::Digest).unwrap();
        assert_eq!(
            refs_to_strings(&out),
            vec!["mirror.example.com/quay/ns/app", "quay.example.com/ns/app"]
        );
    }

    #[test]
    fn test_tag_rules_only_for_tag_pulls() {
        let resolver = MirrorResolver::new(
            vec![],
            vec![],
            vec![rule("example.com/ns", &["tagmirror.example.com/ns"])],
        );
        let reference: Reference = "example.com/ns/app".parse().unwrap();
        let by_tag = resolver.resolve(&reference, PullKind::Tag).unwrap();
        assert_eq!(by_tag.len(), 2);
        let by_digest = resolver.resolve(&reference, PullKind::Digest).unwrap();
        assert_eq!(by_digest.len(), 1);
    }

    #[test]
    fn test_legacy_and_digest_conflict() {
        let resolver = MirrorResolver::new(
            vec![rule("a.example.com", &["m1.example.com"])],
            vec![rule("b.example.com", &["m2.example.com"])],
            vec![],
        );
        let reference: Reference = "a.example.com/app".parse().unwrap();
        assert!(matches!(
            resolver.resolve(&reference, PullKind::Digest),
            Err(PullError::ConflictingMirrorPolicies)
        ));
    }

    #[test]
    fn test_duplicates_removed_keeping_first() {
        let resolver = MirrorResolver::new(
            vec![],
            vec![
                rule("example.com/ns", &["mirror.example.com/x"]),
                rule("example.com", &["mirror.example.com/x/ns"]),
            ],
            vec![],
        );
        let reference: Reference = "example.com/ns/app".parse().unwrap();
        let out = resolver.resolve(&reference, PullKind::Digest).unwrap();
        assert_eq!(
            refs_to_strings(&out),
            vec!["mirror.example.com/x/ns/app", "example.com/ns/app"]
        );
    }

    #[test]
    fn test_bad_mirror_skipped() {
        let resolver = MirrorResolver::new(
            vec![],
            vec![rule("example.com/ns", &["not a valid ref!!", "m.example.com/ns"])],
            vec![],
        );
        let reference: Reference = "example.com/ns/app".parse().unwrap();
        let out = resolver.resolve(&reference, PullKind::Digest).unwrap();
        assert_eq!(
            refs_to_strings(&out),
            vec!["m.example.com/ns/app", "example.com/ns/app"]
        );
    }
}
