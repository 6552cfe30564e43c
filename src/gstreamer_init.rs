//! GStreamer initialization
//!
//! Only compiled with the `gstreamer` feature. Camera capture and Matroska
//! recording call [`init`] before building pipelines; the first call does the
//! work, later calls just report the outcome.

use std::env;
use std::sync::OnceLock;

static GSTREAMER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Initialize GStreamer once for the whole process
pub fn init() -> anyhow::Result<()> {
    let outcome = GSTREAMER_INIT.get_or_init(|| {
        #[cfg(target_os = "windows")]
        if let Err(e) = use_bundled_gstreamer_windows() {
            log::warn!("Failed to set up bundled GStreamer: {}", e);
            log::info!("Will attempt to use system GStreamer installation");
        }

        match gstreamer::init() {
            Ok(()) => {
                log_gstreamer_version();
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to initialize GStreamer: {}", e);
                Err(e.to_string())
            }
        }
    });
    outcome.clone().map_err(anyhow::Error::msg)
}

/// Point GStreamer at a copy shipped next to the executable, if there is one
#[cfg(target_os = "windows")]
fn use_bundled_gstreamer_windows() -> Result<(), String> {
    let exe_path = env::current_exe().map_err(|e| format!("Failed to get executable path: {}", e))?;
    let app_dir = exe_path.parent().ok_or("Failed to get app directory")?;

    let gstreamer_dir = app_dir.join("gstreamer");
    let bin_dir = gstreamer_dir.join("bin");
    let plugin_dir = gstreamer_dir.join("lib").join("gstreamer-1.0");
    if !bin_dir.exists() {
        log::debug!("No bundled GStreamer at {:?}", gstreamer_dir);
        return Ok(());
    }

    log::info!("Using bundled GStreamer at {:?}", gstreamer_dir);
    let path = env::var("PATH").unwrap_or_default();
    env::set_var("PATH", format!("{};{}", bin_dir.display(), path));
    if plugin_dir.exists() {
        env::set_var("GST_PLUGIN_PATH", &plugin_dir);
    }
    if let Some(local_app_data) = dirs::data_local_dir() {
        let registry = local_app_data.join("vigil").join("gst-registry.bin");
        if let Some(parent) = registry.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        env::set_var("GST_REGISTRY", &registry);
    }
    Ok(())
}

fn log_gstreamer_version() {
    let (major, minor, micro, _) = gstreamer::version();
    log::info!("GStreamer {}.{}.{} initialized", major, minor, micro);
    if let Ok(plugin_path) = env::var("GST_PLUGIN_PATH") {
        log::debug!("GST_PLUGIN_PATH: {}", plugin_path);
    }
}
