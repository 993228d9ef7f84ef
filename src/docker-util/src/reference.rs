// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Image reference parsing.
//!
//! An image reference in a composition is either *named* — a
//! `registry/repo[:tag][@digest]` form that can be pulled — or an opaque
//! local image ID (a hex string, possibly abbreviated, possibly prefixed
//! with `sha256:`). The two cannot be distinguished syntactically in all
//! cases (`cafe` is both a plausible repository name and a plausible ID
//! prefix), so parsing consults the local image index and only treats a
//! string as an ID when it actually abbreviates a local image.

use std::fmt;

use crate::LocalImageIndex;

/// A parsed image reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageRef {
    Named(NamedRef),
    /// A local image ID, as stored by the daemon (`sha256:<hex>`).
    Id(String),
}

impl ImageRef {
    /// Parses `s`, using `index` to disambiguate abbreviated local IDs from
    /// repository names.
    pub fn parse(s: &str, index: &LocalImageIndex) -> ImageRef {
        if let Some(hex) = s.strip_prefix("sha256:") {
            if is_hex(hex) {
                return ImageRef::Id(s.into());
            }
        }
        if is_hex(s) {
            if let Some(id) = index.expand_id(s) {
                return ImageRef::Id(id);
            }
        }
        let (rest, digest) = match s.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest.to_string())),
            None => (s, None),
        };
        // A colon after the last slash separates the tag; a colon before it
        // is a registry port.
        let tag = match rest.rfind(':') {
            Some(idx) if !rest[idx..].contains('/') => Some(rest[idx + 1..].to_string()),
            _ => None,
        };
        let repo = match &tag {
            Some(tag) => rest[..rest.len() - tag.len() - 1].to_string(),
            None => rest.to_string(),
        };
        ImageRef::Named(NamedRef { repo, tag, digest })
    }
}

/// A named reference: `repo` plus an optional tag and optional digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedRef {
    pub repo: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl NamedRef {
    /// The `repo:tag` form used to match local image tags and to pull,
    /// defaulting the tag to `latest`.
    pub fn tagged(&self) -> String {
        format!("{}:{}", self.repo, self.tag.as_deref().unwrap_or("latest"))
    }

    /// The `repo@digest` form pinning this reference to `digest`.
    pub fn digested(&self, digest: &str) -> String {
        format!("{}@{}", self.repo, digest)
    }

    /// The reference to pull: `repo@digest` when a digest is present,
    /// otherwise `repo:tag`.
    pub fn pullable(&self) -> String {
        match &self.digest {
            Some(digest) => self.digested(digest),
            None => self.tagged(),
        }
    }
}

impl fmt::Display for NamedRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.pullable())
    }
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalImage;

    fn index() -> LocalImageIndex {
        LocalImageIndex::new(vec![LocalImage {
            id: "sha256:cafe0123456789abcdef0123456789abcdef0123456789abcdef0123456789ab"
                .into(),
            repo_tags: vec!["busybox:1.36".into()],
            repo_digests: vec!["busybox@sha256:deadbeef".into()],
        }])
    }

    #[test]
    fn parses_named_forms() {
        let index = index();
        assert_eq!(
            ImageRef::parse("busybox", &index),
            ImageRef::Named(NamedRef {
                repo: "busybox".into(),
                tag: None,
                digest: None,
            })
        );
        assert_eq!(
            ImageRef::parse("registry.local:5000/demo/api:v2", &index),
            ImageRef::Named(NamedRef {
                repo: "registry.local:5000/demo/api".into(),
                tag: Some("v2".into()),
                digest: None,
            })
        );
        assert_eq!(
            ImageRef::parse("registry.local:5000/demo/api", &index),
            ImageRef::Named(NamedRef {
                repo: "registry.local:5000/demo/api".into(),
                tag: None,
                digest: None,
            })
        );
        assert_eq!(
            ImageRef::parse("busybox@sha256:deadbeef", &index),
            ImageRef::Named(NamedRef {
                repo: "busybox".into(),
                tag: None,
                digest: Some("sha256:deadbeef".into()),
            })
        );
    }

    #[test]
    fn disambiguates_ids_via_index() {
        let index = index();
        // An abbreviated hex string that matches a local image is an ID,
        // expanded to the full form.
        assert_eq!(
            ImageRef::parse("cafe0123", &index),
            ImageRef::Id(
                "sha256:cafe0123456789abcdef0123456789abcdef0123456789abcdef0123456789ab"
                    .into()
            )
        );
        // One that matches nothing is a repository name.
        assert_eq!(
            ImageRef::parse("beef", &index),
            ImageRef::Named(NamedRef {
                repo: "beef".into(),
                tag: None,
                digest: None,
            })
        );
        // The sha256: form is always an ID, local or not.
        assert_eq!(
            ImageRef::parse("sha256:0011", &index),
            ImageRef::Id("sha256:0011".into())
        );
    }

    #[test]
    fn renders_pullable_forms() {
        let named = NamedRef {
            repo: "busybox".into(),
            tag: None,
            digest: None,
        };
        assert_eq!(named.tagged(), "busybox:latest");
        assert_eq!(named.digested("sha256:feed"), "busybox@sha256:feed");
        assert_eq!(named.pullable(), "busybox:latest");
    }
}
