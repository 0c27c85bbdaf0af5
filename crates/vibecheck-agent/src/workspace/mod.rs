//! Workspace image observation.
//!
//! Before a query runs, the agent snapshots the mtimes of every image under
//! the working directory; afterwards the diff decides which images to attach
//! to the response. A response that produced no images is additionally
//! scanned for image paths mentioned in its text.

pub mod screenshot;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use tracing::{debug, warn};

use vibecheck_shared::protocol::ImageData;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg", "bmp"];

/// Wall-clock budget for one snapshot walk; on expiry the empty map is used.
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(2);

/// Directories never worth walking for workspace images.
const SKIP_DIRS: &[&str] = &["node_modules", "target", "__pycache__"];

/// Keywords in the *user message* that trigger a screenshot attempt.
const SCREENSHOT_KEYWORDS: &[&str] = &[
    "screenshot",
    "preview",
    "ui",
    "스크린샷",
    "미리보기",
    "화면",
];

pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let lower = e.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}

fn walk_images(dir: &Path, out: &mut HashMap<PathBuf, SystemTime>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || SKIP_DIRS.contains(&name.as_ref()) {
                continue;
            }
            walk_images(&path, out);
        } else if file_type.is_file() && is_image_path(&path) {
            if let Ok(meta) = entry.metadata() {
                if let Ok(mtime) = meta.modified() {
                    out.insert(path, mtime);
                }
            }
        }
    }
}

fn snapshot_blocking(work_dir: &Path) -> HashMap<PathBuf, SystemTime> {
    let mut map = HashMap::new();
    walk_images(work_dir, &mut map);
    map
}

/// Image-mtime snapshot of the workspace, bounded by [`SNAPSHOT_TIMEOUT`].
pub async fn snapshot(work_dir: &Path) -> HashMap<PathBuf, SystemTime> {
    let dir = work_dir.to_path_buf();
    let walk = tokio::task::spawn_blocking(move || snapshot_blocking(&dir));
    match tokio::time::timeout(SNAPSHOT_TIMEOUT, walk).await {
        Ok(Ok(map)) => map,
        Ok(Err(e)) => {
            warn!(error = %e, "image snapshot task failed");
            HashMap::new()
        }
        Err(_) => {
            warn!("image snapshot timed out, using empty map");
            HashMap::new()
        }
    }
}

/// Images created or touched since `before`, in a stable order.
pub async fn modified_since(
    work_dir: &Path,
    before: &HashMap<PathBuf, SystemTime>,
) -> Vec<PathBuf> {
    let after = snapshot(work_dir).await;
    let mut changed: Vec<PathBuf> = after
        .into_iter()
        .filter(|(path, mtime)| match before.get(path) {
            Some(old) => mtime > old,
            None => true,
        })
        .map(|(path, _)| path)
        .collect();
    changed.sort();
    changed
}

/// Whether the user message asks for a visual.
pub fn wants_screenshot(user_message: &str) -> bool {
    let lower = user_message.to_lowercase();
    SCREENSHOT_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

fn abs_image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(/[A-Za-z0-9_\-./]+\.(?:png|jpe?g|gif|webp|svg|bmp))")
            .expect("absolute image path pattern")
    })
}

fn rel_image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)(?:^|[\s`'"(])([A-Za-z0-9][A-Za-z0-9_\-./]*\.(?:png|jpe?g|gif|webp|svg|bmp))"#)
            .expect("relative image path pattern")
    })
}

/// Image files mentioned in response text that actually exist on disk.
pub fn extract_image_paths(text: &str, work_dir: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = Vec::new();

    for capture in abs_image_re().captures_iter(text) {
        let path = PathBuf::from(&capture[1]);
        if path.is_file() && !found.contains(&path) {
            found.push(path);
        }
    }
    for capture in rel_image_re().captures_iter(text) {
        let path = work_dir.join(&capture[1]);
        if path.is_file() && !found.contains(&path) {
            found.push(path);
        }
    }
    found
}

/// Base64-wrap raw image bytes for the wire.
pub fn encode_image(filename: &str, bytes: &[u8]) -> ImageData {
    ImageData {
        filename: filename.to_string(),
        data: BASE64.encode(bytes),
    }
}

/// Read and base64-encode one image for attachment.
pub fn load_image(path: &Path) -> Option<ImageData> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "cannot read image");
            return None;
        }
    };
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string());
    Some(encode_image(&filename, &bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vibecheck_ws_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn image_extension_detection() {
        assert!(is_image_path(Path::new("/a/chart.PNG")));
        assert!(is_image_path(Path::new("out.jpeg")));
        assert!(!is_image_path(Path::new("/a/report.txt")));
        assert!(!is_image_path(Path::new("/a/png")));
    }

    #[tokio::test]
    async fn snapshot_and_diff_sees_new_file() {
        let dir = scratch("diff");
        std::fs::write(dir.join("old.png"), b"old").unwrap();
        let before = snapshot(&dir).await;
        assert_eq!(before.len(), 1);

        std::fs::write(dir.join("new.png"), b"new").unwrap();
        let changed = modified_since(&dir, &before).await;
        assert_eq!(changed, vec![dir.join("new.png")]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn snapshot_skips_hidden_and_vendor_dirs() {
        let dir = scratch("skip");
        std::fs::create_dir_all(dir.join(".git")).unwrap();
        std::fs::create_dir_all(dir.join("node_modules")).unwrap();
        std::fs::write(dir.join(".git/a.png"), b"x").unwrap();
        std::fs::write(dir.join("node_modules/b.png"), b"x").unwrap();
        std::fs::write(dir.join("keep.png"), b"x").unwrap();
        let map = snapshot(&dir).await;
        assert_eq!(map.len(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn screenshot_keywords_match_user_message_only() {
        assert!(wants_screenshot("show me a Screenshot of the page"));
        assert!(wants_screenshot("UI 미리보기 보여줘"));
        assert!(wants_screenshot("스크린샷 부탁해"));
        assert!(!wants_screenshot("fix the failing test"));
    }

    #[test]
    fn extracts_existing_paths_from_text() {
        let dir = scratch("extract");
        std::fs::write(dir.join("chart.png"), b"x").unwrap();
        let abs = dir.join("chart.png");
        let text = format!(
            "saved to {} and also chart.png plus missing.png",
            abs.display()
        );
        let found = extract_image_paths(&text, &dir);
        // The absolute mention and the relative mention are the same file,
        // deduplicated; missing.png does not exist.
        assert_eq!(found, vec![abs]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_image_encodes_base64() {
        let dir = scratch("load");
        let path = dir.join("tiny.png");
        std::fs::write(&path, b"hi").unwrap();
        let image = load_image(&path).unwrap();
        assert_eq!(image.filename, "tiny.png");
        assert_eq!(image.data, "aGk=");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
