//! Dynamic task expander
//!
//! Turns manifest documents into the task specs a bootstrap build fans out
//! over. Expansion is lazy: entries are resolved, filtered and injected one
//! at a time as the sequence is consumed.

mod manifest;

pub use manifest::{Manifest, ManifestError, ManifestSource, ProjectEntry};

use deeptracy_core::domain::task::{DEFAULT_STRATEGY, TaskSpec};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value as JsonValue;
use std::collections::btree_map;
use thiserror::Error;
use tracing::{debug, warn};

/// Path of the per-repository manifest, relative to the checkout root
pub const REPOSITORY_MANIFEST: &str = ".deeptracy.yml";

/// Images containing this marker are API-only and never triggered directly
pub const API_IMAGE_MARKER: &str = "-api";

/// Option key carrying the checked-out repository path
pub const REPO_PATH_OPTION: &str = "path";

/// Image allow-list built from glob patterns
#[derive(Debug, Clone)]
pub struct AllowList {
    set: GlobSet,
}

impl AllowList {
    pub fn new<I, S>(patterns: I) -> Result<Self, globset::Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(&pattern.into())?);
        }

        Ok(Self {
            set: builder.build()?,
        })
    }

    pub fn permits(&self, image: &str) -> bool {
        self.set.is_match(image)
    }
}

/// A manifest entry whose image matched no allow-list pattern
#[derive(Debug, Clone, PartialEq, Error)]
#[error("project {project} uses image {image}, which is not allowed")]
pub struct DisallowedImage {
    pub project: String,
    pub image: String,
}

/// Where expansion happens
#[derive(Debug, Clone)]
pub struct ExpandContext {
    /// Checkout path injected into every spec's options
    pub repo_path: String,
    pub allow_list: AllowList,
}

/// Lazy sequence of the task specs of one manifest
///
/// Consuming it is the single pass over the manifest; rejections are
/// recorded as they are encountered.
pub struct TaskSpecs<'a> {
    origin: String,
    entries: btree_map::IntoIter<String, ProjectEntry>,
    ctx: &'a ExpandContext,
    rejections: Vec<DisallowedImage>,
}

impl TaskSpecs<'_> {
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Entries dropped by the allow-list so far
    pub fn rejections(&self) -> &[DisallowedImage] {
        &self.rejections
    }

    fn resolve(&self, project: String, entry: ProjectEntry) -> TaskSpec {
        let mut options = entry.config.unwrap_or_default();
        options.insert(
            REPO_PATH_OPTION.to_string(),
            JsonValue::from(self.ctx.repo_path.as_str()),
        );

        TaskSpec {
            project,
            image: entry.image,
            strategy: entry
                .strategy
                .unwrap_or_else(|| DEFAULT_STRATEGY.to_string()),
            unimportant: entry.unimportant,
            options,
        }
    }
}

impl Iterator for TaskSpecs<'_> {
    type Item = TaskSpec;

    fn next(&mut self) -> Option<TaskSpec> {
        loop {
            let (project, entry) = self.entries.next()?;

            if entry.image.contains(API_IMAGE_MARKER) {
                debug!(
                    "Skipping API image {} of project {} ({})",
                    entry.image, project, self.origin
                );
                continue;
            }

            if !self.ctx.allow_list.permits(&entry.image) {
                let rejection = DisallowedImage {
                    project,
                    image: entry.image,
                };
                warn!("Rejected task from {}: {}", self.origin, rejection);
                self.rejections.push(rejection);
                continue;
            }

            return Some(self.resolve(project, entry));
        }
    }
}

/// Expands one manifest document
pub fn expand<'a>(
    text: &str,
    origin: &str,
    ctx: &'a ExpandContext,
) -> Result<TaskSpecs<'a>, ManifestError> {
    let manifest = Manifest::parse(text, origin)?;

    Ok(TaskSpecs {
        origin: origin.to_string(),
        entries: manifest.into_projects().into_iter(),
        ctx,
        rejections: Vec::new(),
    })
}

/// Expands every source in order and concatenates the results
///
/// A source that cannot be read or parsed contributes nothing; the error is
/// logged and the remaining sources are still expanded.
pub fn expand_sources<'a>(
    sources: Vec<ManifestSource>,
    ctx: &'a ExpandContext,
) -> impl Iterator<Item = TaskSpec> + 'a {
    sources.into_iter().flat_map(move |source| {
        let specs = source
            .text
            .and_then(|text| expand(&text, &source.origin, ctx));

        match specs {
            Ok(specs) => Some(specs),
            Err(e) => {
                warn!("Ignoring manifest: {}", e);
                None
            }
        }
        .into_iter()
        .flatten()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(patterns: &[&str]) -> ExpandContext {
        ExpandContext {
            repo_path: "/workspace/a-1/repo".to_string(),
            allow_list: AllowList::new(patterns.iter().copied()).unwrap(),
        }
    }

    #[test]
    fn test_single_allowed_project() {
        let ctx = ctx(&["scan-*"]);

        let specs: Vec<_> = expand(r#"{"projects": {"A": {"type": "scan-image"}}}"#, "repo", &ctx)
            .unwrap()
            .collect();

        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].project, "A");
        assert_eq!(specs[0].image, "scan-image");
        assert_eq!(specs[0].strategy, "main");
        assert!(!specs[0].unimportant);
        assert_eq!(
            specs[0].options.get(REPO_PATH_OPTION),
            Some(&JsonValue::from("/workspace/a-1/repo"))
        );
    }

    #[test]
    fn test_disallowed_image_is_rejected() {
        let ctx = ctx(&["scan-*"]);

        let mut specs =
            expand(r#"{"projects": {"A": {"type": "other-image"}}}"#, "repo", &ctx).unwrap();

        assert!(specs.next().is_none());
        assert_eq!(
            specs.rejections(),
            &[DisallowedImage {
                project: "A".to_string(),
                image: "other-image".to_string(),
            }]
        );
    }

    #[test]
    fn test_api_images_are_skipped_silently() {
        let ctx = ctx(&["scan-*"]);

        let mut specs = expand(
            "projects:\n  web:\n    type: scan-api\n  lib:\n    type: scan-lib\n",
            "repo",
            &ctx,
        )
        .unwrap();

        assert_eq!(specs.next().map(|s| s.project), Some("lib".to_string()));
        assert!(specs.next().is_none());
        assert!(specs.rejections().is_empty());
    }

    #[test]
    fn test_config_is_kept_and_path_injected() {
        let ctx = ctx(&["deeptracy/*"]);

        let specs: Vec<_> = expand(
            "projects:\n  b:\n    type: deeptracy/npm\n    config:\n      depth: 2\n      path: /elsewhere\n",
            "repo",
            &ctx,
        )
        .unwrap()
        .collect();

        assert_eq!(specs[0].options.get("depth"), Some(&JsonValue::from(2)));
        assert_eq!(
            specs[0].options.get(REPO_PATH_OPTION),
            Some(&JsonValue::from("/workspace/a-1/repo"))
        );
    }

    #[test]
    fn test_empty_default_manifest_is_identity() {
        let ctx = ctx(&["scan-*"]);
        let repo = "projects:\n  A:\n    type: scan-a\n  B:\n    type: scan-b\n    unimportant: true\n";

        let alone: Vec<_> = expand(repo, "repo", &ctx).unwrap().collect();
        let combined: Vec<_> = expand_sources(
            vec![
                ManifestSource::new("default", ""),
                ManifestSource::new("repo", repo),
            ],
            &ctx,
        )
        .collect();

        assert_eq!(combined, alone);
    }

    #[test]
    fn test_bad_source_does_not_affect_others() {
        let ctx = ctx(&["scan-*"]);

        let specs: Vec<_> = expand_sources(
            vec![
                ManifestSource::unreadable("default", "permission denied"),
                ManifestSource::new("broken", "projects: [unclosed"),
                ManifestSource::new("repo", "projects:\n  A:\n    type: scan-a\n"),
            ],
            &ctx,
        )
        .collect();

        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].project, "A");
    }

    #[test]
    fn test_every_spec_matches_allow_list() {
        let ctx = ctx(&["scan-*", "deeptracy/*"]);
        let manifest = "projects:\n  a:\n    type: scan-x\n  b:\n    type: other\n  c:\n    type: deeptracy/y\n  d:\n    type: evil/scan-x\n  e:\n    type: scan-api\n";

        let mut specs = expand(manifest, "repo", &ctx).unwrap();
        let produced: Vec<_> = specs.by_ref().collect();

        assert_eq!(produced.len(), 2);
        assert!(produced.iter().all(|s| ctx.allow_list.permits(&s.image)));
        assert_eq!(specs.rejections().len(), 2);
    }
}
