// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Artifact naming: the `%name` / `%date` / `%range` template language and the
// no-overwrite file reservation used by every sink.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Local, Timelike};
use tracing::warn;

/// Highest `(n)` suffix tried before giving up on a name.
const MAX_COLLISION_SUFFIX: u32 = 9_999;

/// Separators swallowed together with an omitted `%range`.
const RANGE_SEPARATORS: [char; 4] = ['_', '-', ' ', '.'];

/// Output name template.
///
/// `%name` is the source (or mission) name, `%date` expands the datetime
/// sub-template, and `%range` expands to `p{start}-{end}` for partial page
/// ranges.  For full-range documents `%range` disappears together with one
/// preceding separator, so `%name_%range` renders as just the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameTemplate {
    template: String,
    datetime_format: String,
}

impl NameTemplate {
    pub fn new(template: impl Into<String>, datetime_format: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            datetime_format: datetime_format.into(),
        }
    }

    /// Render the template into a sanitized file stem (no extension).
    pub fn render(&self, name: &str, range: Option<(u32, u32)>, at: &DateTime<Local>) -> String {
        let mut out = String::with_capacity(self.template.len() + name.len());
        let mut rest = self.template.as_str();
        while let Some(pos) = rest.find('%') {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            if let Some(after) = tail.strip_prefix("%name") {
                out.push_str(name);
                rest = after;
            } else if let Some(after) = tail.strip_prefix("%date") {
                out.push_str(&self.render_date(at));
                rest = after;
            } else if let Some(after) = tail.strip_prefix("%range") {
                match range {
                    Some((start, end)) => out.push_str(&format!("p{start}-{end}")),
                    None => {
                        if out.ends_with(&RANGE_SEPARATORS[..]) {
                            out.pop();
                        }
                    }
                }
                rest = after;
            } else {
                out.push('%');
                rest = &tail[1..];
            }
        }
        out.push_str(rest);
        sanitize_file_stem(&out)
    }

    /// Expand the datetime sub-template (`%Y %m %d %H %M %S %unix`).
    pub fn render_date(&self, at: &DateTime<Local>) -> String {
        let mut out = String::new();
        let mut rest = self.datetime_format.as_str();
        while let Some(pos) = rest.find('%') {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            if let Some(after) = tail.strip_prefix("%unix") {
                out.push_str(&at.timestamp().to_string());
                rest = after;
                continue;
            }
            let token = tail[1..].chars().next();
            let expanded = match token {
                Some('Y') => Some(format!("{:04}", at.year())),
                Some('m') => Some(format!("{:02}", at.month())),
                Some('d') => Some(format!("{:02}", at.day())),
                Some('H') => Some(format!("{:02}", at.hour())),
                Some('M') => Some(format!("{:02}", at.minute())),
                Some('S') => Some(format!("{:02}", at.second())),
                _ => None,
            };
            match expanded {
                Some(text) => {
                    out.push_str(&text);
                    rest = &tail[2..];
                }
                None => {
                    out.push('%');
                    rest = &tail[1..];
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// Replace characters that are not allowed in file names.
pub fn sanitize_file_stem(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        "untitled".into()
    } else {
        trimmed.to_string()
    }
}

/// Atomically create `dir/stem.ext`, or the first free `dir/stem (n).ext`.
///
/// Existing files are never opened for writing.
pub fn reserve_path(dir: &Path, stem: &str, ext: &str) -> io::Result<(PathBuf, File)> {
    let first = dir.join(format!("{stem}.{ext}"));
    match OpenOptions::new().write(true).create_new(true).open(&first) {
        Ok(file) => return Ok((first, file)),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e),
    }
    for n in 1..=MAX_COLLISION_SUFFIX {
        let candidate = dir.join(format!("{stem} ({n}).{ext}"));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => {
                warn!(
                    wanted = %first.display(),
                    chosen = %candidate.display(),
                    "output name already taken, using a numbered variant"
                );
                return Ok((candidate, file));
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {}", first.display()),
    ))
}

/// Path of the in-progress file for `path` (`x.text.pdf` -> `x.text.pdf.part`).
pub fn part_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".part");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2023, 9, 1, 12, 13, 7).unwrap()
    }

    #[test]
    fn default_template_renders_exact_name() {
        let t = NameTemplate::new("[OCR]_%name_%date", "%Y%m%d_%H%M");
        assert_eq!(t.render("report", None, &at()), "[OCR]_report_20230901_1213");
    }

    #[test]
    fn range_renders_or_disappears_with_its_separator() {
        let t = NameTemplate::new("%name_%range", "%Y");
        assert_eq!(t.render("book", Some((3, 9)), &at()), "book_p3-9");
        assert_eq!(t.render("book", None, &at()), "book");
    }

    #[test]
    fn date_sub_template_components() {
        let t = NameTemplate::new("%date", "%Y-%m-%d %H.%M.%S");
        assert_eq!(t.render("x", None, &at()), "2023-09-01 12.13.07");
        let unix = NameTemplate::new("%date", "%unix").render("x", None, &at());
        assert_eq!(unix, at().timestamp().to_string());
    }

    #[test]
    fn unknown_placeholders_pass_through() {
        let t = NameTemplate::new("100%_%name%x", "%Q");
        assert_eq!(t.render("a", None, &at()), "100%_a%x");
        assert_eq!(t.render_date(&at()), "%Q");
    }

    #[test]
    fn sanitize_replaces_path_characters() {
        assert_eq!(sanitize_file_stem("a/b:c?"), "a_b_c_");
        assert_eq!(sanitize_file_stem("  "), "untitled");
    }

    #[test]
    fn reserve_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("out.txt"), "existing").unwrap();

        let (second, _) = reserve_path(dir.path(), "out", "txt").unwrap();
        let (third, _) = reserve_path(dir.path(), "out", "txt").unwrap();

        assert_eq!(second, dir.path().join("out (1).txt"));
        assert_eq!(third, dir.path().join("out (2).txt"));
        let original = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(original, "existing");
    }

    #[test]
    fn part_path_appends_suffix() {
        let p = part_path(Path::new("/tmp/a.layered.pdf"));
        assert_eq!(p, PathBuf::from("/tmp/a.layered.pdf.part"));
    }
}
