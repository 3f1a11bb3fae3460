use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::info;

use crate::error::{AppError, Context, Result};

/// Opaque platform call that makes the OS re-read the wallpaper file. It can
/// fail independently of the file write; by then the file is already in
/// place, so the next cycle simply tries again.
pub trait DesktopEnvironment: Send + Sync {
    fn set_wallpaper(&self, path: &Path) -> Result<()>;
}

/// Boundary the scheduler publishes through; mocked in scheduler tests.
pub trait Publisher: Send + Sync {
    fn publish(&self, image: &[u8]) -> Result<()>;
}

/// Installs a rendered image as the desktop background without ever exposing
/// a half-written file: bytes go to a sibling temp file, get flushed to disk,
/// and are renamed over the canonical path. Rename within one directory is
/// atomic on the same filesystem, so a crash mid-write leaves the previous
/// wallpaper intact.
pub struct WallpaperPublisher {
    canonical: PathBuf,
    desktop: Box<dyn DesktopEnvironment>,
}

impl WallpaperPublisher {
    pub fn new(canonical: PathBuf, desktop: Box<dyn DesktopEnvironment>) -> Result<Self> {
        if let Some(parent) = canonical.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        Ok(Self { canonical, desktop })
    }

    pub fn canonical_path(&self) -> &Path {
        &self.canonical
    }

    /// Write the bytes to `<canonical>.tmp` in the canonical directory and
    /// flush them to durable storage.
    fn stage(&self, image: &[u8]) -> Result<PathBuf> {
        let mut name = self
            .canonical
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| AppError::Publish("canonical wallpaper path has no file name".into()))?;
        name.push(".tmp");
        let staged = self.canonical.with_file_name(name);

        let mut file = File::create(&staged)
            .with_context(|| format!("Failed to create temp wallpaper {}", staged.display()))?;
        file.write_all(image)
            .with_context(|| format!("Failed to write temp wallpaper {}", staged.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to flush temp wallpaper {}", staged.display()))?;

        Ok(staged)
    }

    /// Atomically promote the staged file onto the canonical path.
    fn promote(&self, staged: &Path) -> Result<()> {
        fs::rename(staged, &self.canonical).with_context(|| {
            format!(
                "Failed to promote {} to {}",
                staged.display(),
                self.canonical.display()
            )
        })?;
        Ok(())
    }
}

impl Publisher for WallpaperPublisher {
    fn publish(&self, image: &[u8]) -> Result<()> {
        let staged = self.stage(image)?;
        if let Err(err) = self.promote(&staged) {
            let _ = fs::remove_file(&staged);
            return Err(err);
        }

        self.desktop.set_wallpaper(&self.canonical)?;
        info!("Wallpaper updated at {}", self.canonical.display());
        Ok(())
    }
}

/// Desktop integration for the current platform.
pub struct SystemDesktop;

impl DesktopEnvironment for SystemDesktop {
    fn set_wallpaper(&self, path: &Path) -> Result<()> {
        set_system_wallpaper(path)
    }
}

#[cfg(target_os = "windows")]
fn set_system_wallpaper(path: &Path) -> Result<()> {
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::UI::WindowsAndMessaging::{
        SystemParametersInfoW, SPIF_SENDCHANGE, SPIF_UPDATEINIFILE, SPI_SETDESKWALLPAPER,
    };

    let wide: Vec<u16> = path
        .as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();
    let ok = unsafe {
        SystemParametersInfoW(
            SPI_SETDESKWALLPAPER,
            0,
            wide.as_ptr() as *mut _,
            SPIF_UPDATEINIFILE | SPIF_SENDCHANGE,
        )
    };
    if ok == 0 {
        return Err(AppError::Publish(
            "SystemParametersInfoW rejected the wallpaper".into(),
        ));
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn set_system_wallpaper(path: &Path) -> Result<()> {
    use std::process::Command;

    let script = format!(
        "tell application \"Finder\" to set desktop picture to POSIX file \"{}\"",
        path.display()
    );
    let status = Command::new("osascript").arg("-e").arg(script).status()?;
    if !status.success() {
        return Err(AppError::Publish(format!(
            "osascript exited with {}",
            status
        )));
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "macos")))]
fn set_system_wallpaper(path: &Path) -> Result<()> {
    use std::process::Command;

    let uri = format!("file://{}", path.display());
    let status = Command::new("gsettings")
        .args(["set", "org.gnome.desktop.background", "picture-uri", &uri])
        .status()?;
    if !status.success() {
        return Err(AppError::Publish(format!(
            "gsettings exited with {}",
            status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingDesktop {
        calls: Mutex<Vec<PathBuf>>,
    }

    impl RecordingDesktop {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl DesktopEnvironment for RecordingDesktop {
        fn set_wallpaper(&self, path: &Path) -> Result<()> {
            self.calls.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
    }

    struct FailingDesktop;

    impl DesktopEnvironment for FailingDesktop {
        fn set_wallpaper(&self, _path: &Path) -> Result<()> {
            Err(AppError::Publish("desktop call refused".into()))
        }
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "wallstonks-publish-{}-{}",
            std::process::id(),
            name
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn publish_writes_file_and_invokes_desktop() {
        let dir = scratch_dir("happy");
        let canonical = dir.join("wallpaper.png");
        let publisher =
            WallpaperPublisher::new(canonical.clone(), Box::new(RecordingDesktop::new()))
                .expect("publisher");

        publisher.publish(b"first image").expect("publish");

        assert_eq!(fs::read(&canonical).unwrap(), b"first image");
        assert!(!canonical.with_file_name("wallpaper.png.tmp").exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn staged_but_unpromoted_write_leaves_previous_wallpaper_intact() {
        let dir = scratch_dir("crash");
        let canonical = dir.join("wallpaper.png");
        let publisher =
            WallpaperPublisher::new(canonical.clone(), Box::new(RecordingDesktop::new()))
                .expect("publisher");

        publisher.publish(b"previous publish").expect("publish");

        // Simulate a crash after the temp write but before the rename.
        let staged = publisher.stage(b"torn write").expect("stage");
        assert!(staged.exists());
        assert_eq!(fs::read(&canonical).unwrap(), b"previous publish");

        // Recovery: the next full publish wins and clears the temp file.
        publisher.publish(b"next publish").expect("publish");
        assert_eq!(fs::read(&canonical).unwrap(), b"next publish");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn desktop_failure_still_leaves_file_in_place() {
        let dir = scratch_dir("desktop-fail");
        let canonical = dir.join("wallpaper.png");
        let publisher = WallpaperPublisher::new(canonical.clone(), Box::new(FailingDesktop))
            .expect("publisher");

        let err = publisher.publish(b"image bytes").expect_err("desktop fails");
        assert!(matches!(err, AppError::Publish(_)));
        assert_eq!(fs::read(&canonical).unwrap(), b"image bytes");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn repeated_publish_replaces_content() {
        let dir = scratch_dir("replace");
        let canonical = dir.join("wallpaper.png");
        let publisher =
            WallpaperPublisher::new(canonical.clone(), Box::new(RecordingDesktop::new()))
                .expect("publisher");

        publisher.publish(b"one").expect("publish");
        publisher.publish(b"two").expect("publish");
        assert_eq!(fs::read(&canonical).unwrap(), b"two");

        let _ = fs::remove_dir_all(&dir);
    }
}
