//! Artifact handling for executions.
//!
//! Executions produce artifacts two ways: files written under the session
//! cwd (detected by diffing a directory snapshot taken around the
//! execution) and inline payloads carried in the result. Inline payloads
//! without a file name are persisted into the cwd so every artifact is
//! downloadable over HTTP.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::debug;
use tracing::warn;

use crucible_protocol::ArtifactKind;
use crucible_protocol::ContentEncoding;
use crucible_protocol::ExecutionArtifact;

const PREVIEW_LIMIT: usize = 100;

/// Modification-time snapshot of every file under `cwd`, keyed by relative
/// path.
pub(crate) fn snapshot_cwd(cwd: &Path) -> HashMap<PathBuf, SystemTime> {
    let mut snapshot = HashMap::new();
    walk(cwd, cwd, &mut snapshot);
    snapshot
}

fn walk(root: &Path, dir: &Path, out: &mut HashMap<PathBuf, SystemTime>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        if path.is_dir() {
            walk(root, &path, out);
        } else if let Ok(metadata) = entry.metadata() {
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if let Ok(relative) = path.strip_prefix(root) {
                out.insert(relative.to_path_buf(), modified);
            }
        }
    }
}

/// Files that appeared (or changed) since `before` become artifacts of the
/// finished execution.
pub(crate) fn collect_new_artifacts(
    cwd: &Path,
    before: &HashMap<PathBuf, SystemTime>,
) -> Vec<ExecutionArtifact> {
    let after = snapshot_cwd(cwd);
    let mut changed: Vec<&PathBuf> = after
        .iter()
        .filter(|(path, modified)| before.get(*path) != Some(modified))
        .map(|(path, _)| path)
        .collect();
    changed.sort();

    changed
        .into_iter()
        .map(|relative| {
            let file_name = relative.to_string_lossy().to_string();
            let kind = kind_for_path(relative);
            let mime_type = mime_guess::from_path(relative)
                .first_or_octet_stream()
                .to_string();
            let name = relative
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .unwrap_or_else(|| file_name.clone());
            ExecutionArtifact {
                name,
                kind,
                mime_type,
                original_name: file_name.clone(),
                preview: preview_for(cwd, relative, kind),
                file_name: Some(file_name),
                file_content: None,
                file_content_encoding: ContentEncoding::Utf8,
                download_url: None,
            }
        })
        .collect()
}

/// Kind of an inline payload, derived from its declared mime type.
pub(crate) fn kind_for_mime(mime_type: &str) -> ArtifactKind {
    match mime_type {
        "image/svg+xml" => ArtifactKind::Svg,
        "text/html" => ArtifactKind::Html,
        "text/csv" => ArtifactKind::Dataframe,
        "application/json" => ArtifactKind::Chart,
        other if other.starts_with("image/") => ArtifactKind::Image,
        other if other.starts_with("text/") => ArtifactKind::Text,
        _ => ArtifactKind::File,
    }
}

fn kind_for_path(path: &Path) -> ArtifactKind {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" | "jpg" | "jpeg" | "gif" => ArtifactKind::Image,
        "svg" => ArtifactKind::Svg,
        "html" => ArtifactKind::Html,
        "csv" => ArtifactKind::Dataframe,
        "txt" | "md" => ArtifactKind::Text,
        "json" => ArtifactKind::Chart,
        _ => ArtifactKind::File,
    }
}

fn preview_for(cwd: &Path, relative: &Path, kind: ArtifactKind) -> String {
    match kind {
        ArtifactKind::Text | ArtifactKind::Dataframe | ArtifactKind::Chart => {
            match fs::read_to_string(cwd.join(relative)) {
                Ok(content) => content.chars().take(PREVIEW_LIMIT).collect(),
                Err(_) => String::new(),
            }
        }
        ArtifactKind::Html => "Web Page".to_string(),
        _ => String::new(),
    }
}

fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "image/gif" => ".gif",
        "image/svg+xml" => ".svg",
        "text/html" => ".html",
        "application/json" => ".json",
        _ => ".bin",
    }
}

/// Writes inline artifact content to disk so everything in the result can be
/// fetched through the download endpoint. Failures are logged and leave the
/// artifact untouched; the execution result is never failed over this.
pub(crate) fn persist_inline_artifacts(cwd: &Path, artifacts: &mut [ExecutionArtifact]) {
    for artifact in artifacts {
        let Some(content) = artifact.file_content.as_ref() else {
            continue;
        };
        if artifact.file_name.is_some() {
            continue;
        }

        let file_name = format!(
            "{}{}",
            artifact.name,
            extension_for_mime(&artifact.mime_type)
        );
        let path = cwd.join(&file_name);

        let written = match artifact.file_content_encoding {
            ContentEncoding::Base64 => match BASE64.decode(content.as_bytes()) {
                Ok(bytes) => fs::write(&path, bytes),
                Err(err) => {
                    warn!("failed to decode inline artifact {}: {err}", artifact.name);
                    continue;
                }
            },
            ContentEncoding::Utf8 => fs::write(&path, content.as_bytes()),
        };

        match written {
            Ok(()) => {
                debug!("saved inline artifact to {}", path.display());
                artifact.file_name = Some(file_name.clone());
                artifact.original_name = file_name;
            }
            Err(err) => {
                warn!("failed to save inline artifact {}: {err}", artifact.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn new_files_are_collected_with_kind_and_mime() {
        let dir = TempDir::new().expect("tempdir");
        let before = snapshot_cwd(dir.path());
        fs::write(dir.path().join("table.csv"), "a,b\n1,2\n").expect("write");
        fs::write(dir.path().join("plot.png"), b"\x89PNG").expect("write");

        let artifacts = collect_new_artifacts(dir.path(), &before);
        assert_eq!(artifacts.len(), 2);
        let table = artifacts
            .iter()
            .find(|a| a.name == "table")
            .expect("csv artifact");
        assert_eq!(table.kind, ArtifactKind::Dataframe);
        assert_eq!(table.mime_type, "text/csv");
        assert_eq!(table.preview, "a,b\n1,2\n");
        let plot = artifacts
            .iter()
            .find(|a| a.name == "plot")
            .expect("png artifact");
        assert_eq!(plot.kind, ArtifactKind::Image);
        assert_eq!(plot.file_name.as_deref(), Some("plot.png"));
    }

    #[test]
    fn unchanged_files_are_not_artifacts() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("old.txt"), "old").expect("write");
        let before = snapshot_cwd(dir.path());
        let artifacts = collect_new_artifacts(dir.path(), &before);
        assert_eq!(artifacts, vec![]);
    }

    #[test]
    fn hidden_files_are_ignored() {
        let dir = TempDir::new().expect("tempdir");
        let before = snapshot_cwd(dir.path());
        fs::write(dir.path().join(".hidden"), "x").expect("write");
        assert_eq!(collect_new_artifacts(dir.path(), &before), vec![]);
    }

    #[test]
    fn mime_types_map_onto_artifact_kinds() {
        assert_eq!(kind_for_mime("image/svg+xml"), ArtifactKind::Svg);
        assert_eq!(kind_for_mime("image/png"), ArtifactKind::Image);
        assert_eq!(kind_for_mime("text/html"), ArtifactKind::Html);
        assert_eq!(kind_for_mime("text/csv"), ArtifactKind::Dataframe);
        assert_eq!(kind_for_mime("application/json"), ArtifactKind::Chart);
        assert_eq!(kind_for_mime("text/plain"), ArtifactKind::Text);
        assert_eq!(kind_for_mime("application/pdf"), ArtifactKind::File);
    }

    #[test]
    fn inline_base64_content_is_persisted() {
        let dir = TempDir::new().expect("tempdir");
        let mut artifacts = vec![ExecutionArtifact {
            name: "chart".to_string(),
            kind: ArtifactKind::Image,
            mime_type: "image/png".to_string(),
            original_name: String::new(),
            file_name: None,
            file_content: Some(BASE64.encode(b"png-bytes")),
            file_content_encoding: ContentEncoding::Base64,
            preview: String::new(),
            download_url: None,
        }];

        persist_inline_artifacts(dir.path(), &mut artifacts);

        let file_name = artifacts[0].file_name.as_deref().expect("persisted");
        assert_eq!(file_name, "chart.png");
        let bytes = fs::read(dir.path().join(file_name)).expect("read back");
        assert_eq!(bytes, b"png-bytes");
    }

    #[test]
    fn inline_utf8_content_is_persisted_verbatim() {
        let dir = TempDir::new().expect("tempdir");
        let mut artifacts = vec![ExecutionArtifact {
            name: "drawing".to_string(),
            kind: ArtifactKind::Svg,
            mime_type: "image/svg+xml".to_string(),
            original_name: String::new(),
            file_name: None,
            file_content: Some("<svg/>".to_string()),
            file_content_encoding: ContentEncoding::Utf8,
            preview: String::new(),
            download_url: None,
        }];

        persist_inline_artifacts(dir.path(), &mut artifacts);

        assert_eq!(artifacts[0].file_name.as_deref(), Some("drawing.svg"));
        let content =
            fs::read_to_string(dir.path().join("drawing.svg")).expect("read back");
        assert_eq!(content, "<svg/>");
    }

    #[test]
    fn artifacts_with_file_names_are_left_alone() {
        let dir = TempDir::new().expect("tempdir");
        let mut artifacts = vec![ExecutionArtifact {
            name: "existing".to_string(),
            kind: ArtifactKind::File,
            mime_type: "application/octet-stream".to_string(),
            original_name: "existing.bin".to_string(),
            file_name: Some("existing.bin".to_string()),
            file_content: Some("ignored".to_string()),
            file_content_encoding: ContentEncoding::Utf8,
            preview: String::new(),
            download_url: None,
        }];
        persist_inline_artifacts(dir.path(), &mut artifacts);
        assert!(!dir.path().join("existing.bin").exists());
    }
}
