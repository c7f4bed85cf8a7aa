// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Submission expansion: turns what a caller hands in (files, buffers,
// documents with page selections, directories) into ordered job specs.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use lesewerk_core::error::{LesewerkError, Result};
use lesewerk_core::{DocumentRef, InputKind, JobSource, JobSpec, MissionConfig, PageSpan};

/// Largest document a single submission may expand.
pub const MAX_PAGES: u32 = 10_000;

/// Body of a mission submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Overrides the server's default mission configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<MissionConfig>,
    pub items: Vec<SubmitItem>,
}

/// One thing to recognise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubmitItem {
    Image {
        path: PathBuf,
    },
    Buffer {
        name: String,
        bytes: Vec<u8>,
        /// Inferred from `name` when omitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<InputKind>,
    },
    Text {
        path: PathBuf,
    },
    /// A paginated document.  The page count is supplied by the caller,
    /// which already opened the document.
    Document {
        path: PathBuf,
        page_count: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        range: Option<PageSpan>,
        /// Explicit 1-based pages; wins over `range`.  Negative values count
        /// from the end.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pages: Option<Vec<i64>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    /// Every image and text file in a directory.
    Directory {
        path: PathBuf,
    },
}

impl SubmitItem {
    /// Build an item from a bare path, classifying by extension.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.is_dir() {
            return Ok(Self::Directory { path });
        }
        match InputKind::from_path(&path) {
            Some(InputKind::Image) => Ok(Self::Image { path }),
            Some(InputKind::Text) => Ok(Self::Text { path }),
            Some(InputKind::Document) => Err(LesewerkError::InvalidSubmission(format!(
                "{} is a document; submit it with its page count",
                path.display()
            ))),
            None => Err(LesewerkError::InvalidSubmission(format!(
                "unsupported file type: {}",
                path.display()
            ))),
        }
    }

    /// Stem used to name a mission after its first item.
    fn stem(&self) -> Option<String> {
        let path = match self {
            Self::Image { path }
            | Self::Text { path }
            | Self::Document { path, .. }
            | Self::Directory { path } => path.as_path(),
            Self::Buffer { name, .. } => Path::new(name),
        };
        path.file_stem().map(|s| s.to_string_lossy().into_owned())
    }
}

/// Mission name: the given one, else the first item's stem.
pub fn mission_name(request: &MissionRequest) -> String {
    request
        .name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .or_else(|| request.items.first().and_then(SubmitItem::stem))
        .unwrap_or_else(|| "mission".to_string())
}

/// Expand items into job specs in submission order.
pub fn expand(items: Vec<SubmitItem>, config: &MissionConfig) -> Result<Vec<JobSpec>> {
    let mut specs = Vec::new();
    for item in items {
        match item {
            SubmitItem::Image { path } => specs.push(JobSpec::image(path)),
            SubmitItem::Text { path } => specs.push(file_spec(path, InputKind::Text)),
            SubmitItem::Buffer { name, bytes, kind } => {
                let kind = kind
                    .or_else(|| InputKind::from_path(Path::new(&name)))
                    .ok_or_else(|| {
                        LesewerkError::InvalidSubmission(format!("cannot classify buffer {name}"))
                    })?;
                specs.push(JobSpec::buffer(name, bytes, kind));
            }
            SubmitItem::Document {
                path,
                page_count,
                range,
                pages,
                password,
            } => {
                let selected = select_pages(page_count, range, pages.as_deref())?;
                let full = is_full(&selected, page_count);
                let source = JobSource::Path { path: path.clone() };
                let password = password.or_else(|| config.passwords.get(&source.key()).cloned());
                let document = DocumentRef {
                    key: source.key(),
                    name: source.display_name(),
                    page_count,
                    range: (!full).then(|| span_of(&selected)),
                };
                debug!(document = %document.name, pages = selected.len(), "expanding document");
                specs.extend(selected.into_iter().map(|page| JobSpec {
                    source: source.clone(),
                    kind: InputKind::Document,
                    page: Some(page),
                    document: Some(document.clone()),
                    password: password.clone(),
                }));
            }
            SubmitItem::Directory { path } => {
                specs.extend(scan_directory(&path, config.recursive_import)?)
            }
        }
    }
    Ok(specs)
}

fn file_spec(path: PathBuf, kind: InputKind) -> JobSpec {
    JobSpec {
        source: JobSource::Path { path },
        kind,
        page: None,
        document: None,
        password: None,
    }
}

/// Resolve a page selection to 1-based pages, in request order.
pub fn select_pages(
    page_count: u32,
    range: Option<PageSpan>,
    pages: Option<&[i64]>,
) -> Result<Vec<u32>> {
    if page_count == 0 {
        return Err(LesewerkError::InvalidPageRange("document has no pages".into()));
    }
    if page_count > MAX_PAGES {
        return Err(LesewerkError::InvalidPageRange(format!(
            "{page_count} pages exceeds the limit of {MAX_PAGES}"
        )));
    }
    if let Some(pages) = pages {
        if pages.is_empty() {
            return Err(LesewerkError::InvalidPageRange("page list is empty".into()));
        }
        if pages.len() > MAX_PAGES as usize {
            return Err(LesewerkError::InvalidPageRange(format!(
                "{} listed pages exceeds the limit of {MAX_PAGES}",
                pages.len()
            )));
        }
        let count = page_count as i64;
        return pages
            .iter()
            .map(|&p| {
                let resolved = if p < 0 { p + count + 1 } else { p };
                if (1..=count).contains(&resolved) {
                    Ok(resolved as u32)
                } else {
                    Err(LesewerkError::InvalidPageRange(format!(
                        "page {p} is outside 1..{page_count}"
                    )))
                }
            })
            .collect();
    }
    let (start, end) = match range {
        Some(span) => span.resolve(page_count)?,
        None => (1, page_count),
    };
    Ok((start..=end).collect())
}

fn is_full(pages: &[u32], page_count: u32) -> bool {
    pages.len() as u32 == page_count && pages.iter().copied().eq(1..=page_count)
}

fn span_of(pages: &[u32]) -> (u32, u32) {
    let min = pages.iter().copied().min().unwrap_or(1);
    let max = pages.iter().copied().max().unwrap_or(min);
    (min, max)
}

/// Image and text files in `dir`, sorted by name within each directory.
fn scan_directory(dir: &Path, recursive: bool) -> Result<Vec<JobSpec>> {
    if !dir.is_dir() {
        return Err(LesewerkError::InvalidSubmission(format!(
            "not a directory: {}",
            dir.display()
        )));
    }
    let max_depth = if recursive { usize::MAX } else { 1 };

    let mut specs = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        match InputKind::from_path(&path) {
            Some(InputKind::Image) => specs.push(JobSpec::image(path)),
            Some(InputKind::Text) => specs.push(file_spec(path, InputKind::Text)),
            _ => debug!(path = %path.display(), "skipping unsupported file"),
        }
    }
    info!(dir = %dir.display(), jobs = specs.len(), recursive, "Scanned directory");
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(range: Option<PageSpan>, pages: Option<Vec<i64>>) -> SubmitItem {
        SubmitItem::Document {
            path: PathBuf::from("/in/book.pdf"),
            page_count: 10,
            range,
            pages,
            password: None,
        }
    }

    #[test]
    fn full_document_has_no_range() {
        let specs = expand(vec![document(None, None)], &MissionConfig::default()).unwrap();
        assert_eq!(specs.len(), 10);
        assert_eq!(specs[0].page, Some(1));
        assert_eq!(specs[9].page, Some(10));
        assert_eq!(specs[0].document.as_ref().unwrap().range, None);
    }

    #[test]
    fn negative_range_counts_from_the_end() {
        let specs = expand(
            vec![document(Some(PageSpan::new(-3, -1)), None)],
            &MissionConfig::default(),
        )
        .unwrap();
        let pages: Vec<_> = specs.iter().filter_map(|s| s.page).collect();
        assert_eq!(pages, vec![8, 9, 10]);
        assert_eq!(specs[0].document.as_ref().unwrap().range, Some((8, 10)));
    }

    #[test]
    fn page_list_wins_over_range() {
        let pages = select_pages(10, Some(PageSpan::new(1, 2)), Some(&[5, -1])).unwrap();
        assert_eq!(pages, vec![5, 10]);
    }

    #[test]
    fn bad_selections_are_rejected() {
        assert!(select_pages(10, None, Some(&[])).is_err());
        assert!(select_pages(10, None, Some(&[11])).is_err());
        assert!(select_pages(10, None, Some(&[0])).is_err());
        assert!(select_pages(10, Some(PageSpan::new(0, 3)), None).is_err());
        assert!(select_pages(10, Some(PageSpan::new(2, 11)), None).is_err());
        assert!(select_pages(10, Some(PageSpan::new(5, 2)), None).is_err());
        assert!(select_pages(0, None, None).is_err());
    }

    #[test]
    fn oversized_documents_are_rejected_before_expansion() {
        let huge = SubmitItem::Document {
            path: PathBuf::from("/in/huge.pdf"),
            page_count: u32::MAX,
            range: None,
            pages: None,
            password: None,
        };
        let err = expand(vec![huge], &MissionConfig::default()).unwrap_err();
        assert!(matches!(err, LesewerkError::InvalidPageRange(_)));

        assert_eq!(select_pages(MAX_PAGES, None, None).unwrap().len(), MAX_PAGES as usize);
        assert!(select_pages(MAX_PAGES + 1, Some(PageSpan::new(1, 2)), None).is_err());
        let listed = vec![1i64; MAX_PAGES as usize + 1];
        assert!(matches!(
            select_pages(10, None, Some(&listed)),
            Err(LesewerkError::InvalidPageRange(_))
        ));
    }

    #[test]
    fn password_comes_from_config_table() {
        let mut config = MissionConfig::default();
        config.passwords.insert("/in/book.pdf".into(), "hunter2".into());
        let specs = expand(vec![document(None, Some(vec![1]))], &config).unwrap();
        assert_eq!(specs[0].password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn directory_scan_respects_recursion() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.png"), b"x").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.doc"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/c.jpg"), b"x").unwrap();

        let item = SubmitItem::Directory {
            path: dir.path().to_path_buf(),
        };
        let flat = expand(vec![item.clone()], &MissionConfig::default()).unwrap();
        let names: Vec<_> = flat.iter().map(|s| s.source.display_name()).collect();
        assert_eq!(names, vec!["a.txt", "b.png"]);
        assert_eq!(flat[0].kind, InputKind::Text);

        let config = MissionConfig {
            recursive_import: true,
            ..MissionConfig::default()
        };
        assert_eq!(expand(vec![item], &config).unwrap().len(), 3);
    }

    #[test]
    fn missing_directory_is_invalid() {
        let item = SubmitItem::Directory {
            path: PathBuf::from("/definitely/not/here"),
        };
        assert!(matches!(
            expand(vec![item], &MissionConfig::default()),
            Err(LesewerkError::InvalidSubmission(_))
        ));
    }

    #[test]
    fn mission_is_named_after_first_item() {
        let request = MissionRequest {
            items: vec![SubmitItem::Image {
                path: PathBuf::from("/in/scan-01.png"),
            }],
            ..MissionRequest::default()
        };
        assert_eq!(mission_name(&request), "scan-01");
        assert_eq!(mission_name(&MissionRequest::default()), "mission");
    }

    #[test]
    fn buffer_kind_is_inferred_from_name() {
        let item = SubmitItem::Buffer {
            name: "clip.png".into(),
            bytes: vec![1],
            kind: None,
        };
        let specs = expand(vec![item], &MissionConfig::default()).unwrap();
        assert_eq!(specs[0].kind, InputKind::Image);
    }
}
