//! Headless-browser screenshot collaborator.
//!
//! Used when the user message asks for a visual: captures either a running
//! dev server (when `VIBECHECK_PREVIEW_PORT` points at one) or a static
//! `index.html` in the workspace. Every failure degrades to "no image".

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, warn};

/// How long to wait for a dev server port to accept connections.
pub const PORT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for the browser to load and render the target.
pub const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(15);

const PORT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const BROWSER_CANDIDATES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
];

/// Capture a PNG of the workspace's UI, if one can be found.
pub async fn capture_workspace(work_dir: &Path) -> Option<Vec<u8>> {
    if let Some(port) = preview_port() {
        if wait_for_port(port).await {
            return capture_url(&format!("http://127.0.0.1:{port}/")).await;
        }
        warn!(port, "preview port never became ready");
        return None;
    }

    let index = find_index_html(work_dir)?;
    capture_url(&format!("file://{}", index.display())).await
}

fn preview_port() -> Option<u16> {
    std::env::var("VIBECHECK_PREVIEW_PORT").ok()?.parse().ok()
}

/// Poll until the port accepts a TCP connection or the readiness budget runs
/// out.
async fn wait_for_port(port: u16) -> bool {
    let deadline = tokio::time::Instant::now() + PORT_READY_TIMEOUT;
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(PORT_POLL_INTERVAL).await;
    }
}

/// `index.html` at the workspace root, or one directory down.
fn find_index_html(work_dir: &Path) -> Option<PathBuf> {
    let root = work_dir.join("index.html");
    if root.is_file() {
        return Some(root);
    }
    let entries = std::fs::read_dir(work_dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let candidate = path.join("index.html");
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

async fn capture_url(url: &str) -> Option<Vec<u8>> {
    let output_path = std::env::temp_dir().join(format!(
        "vibecheck_shot_{}.png",
        uuid::Uuid::new_v4().simple()
    ));

    for browser in BROWSER_CANDIDATES {
        match run_browser(browser, url, &output_path).await {
            Ok(true) => {
                let bytes = std::fs::read(&output_path).ok();
                let _ = std::fs::remove_file(&output_path);
                if bytes.is_none() {
                    warn!(browser, "browser reported success but wrote no file");
                }
                return bytes;
            }
            Ok(false) => {
                debug!(browser, url, "browser exited without a screenshot");
                let _ = std::fs::remove_file(&output_path);
                return None;
            }
            // Spawn failure: binary not installed, try the next candidate.
            Err(e) => debug!(browser, error = %e, "browser unavailable"),
        }
    }

    warn!("no headless browser available for screenshot");
    None
}

/// Ok(true) on a completed capture, Ok(false) on a browser-side failure,
/// Err when the binary cannot be spawned at all.
async fn run_browser(browser: &str, url: &str, output: &Path) -> std::io::Result<bool> {
    let mut child = Command::new(browser)
        .arg("--headless")
        .arg("--disable-gpu")
        .arg("--hide-scrollbars")
        .arg("--window-size=1280,800")
        .arg(format!("--screenshot={}", output.display()))
        .arg(url)
        .kill_on_drop(true)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;

    match tokio::time::timeout(NAVIGATION_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => Ok(status.success() && output.is_file()),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            warn!(browser, "navigation timed out");
            let _ = child.start_kill();
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_index_html_one_level_down() {
        let dir = std::env::temp_dir().join("vibecheck_shot_index");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(dir.join("site")).unwrap();
        assert!(find_index_html(&dir).is_none());

        std::fs::write(dir.join("site/index.html"), "<html></html>").unwrap();
        assert_eq!(find_index_html(&dir), Some(dir.join("site/index.html")));

        std::fs::write(dir.join("index.html"), "<html></html>").unwrap();
        assert_eq!(find_index_html(&dir), Some(dir.join("index.html")));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
