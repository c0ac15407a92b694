//! Chrome launch command construction.

use crate::config::BrowserDefaults;
use std::path::Path;
use std::process::Command;

/// Options resolved for one session launch.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub headless: bool,
    pub viewport: (u32, u32),
    pub start_url: String,
    pub lang: String,
    pub proxy_server: Option<String>,
    pub fingerprint: Option<String>,
    pub timezone: Option<String>,
    pub custom_args: Vec<String>,
}

impl LaunchOptions {
    pub fn from_defaults(defaults: &BrowserDefaults, start_url: Option<String>) -> Self {
        Self {
            headless: defaults.headless,
            viewport: (defaults.viewport_width, defaults.viewport_height),
            start_url: start_url.unwrap_or_else(|| "about:blank".to_string()),
            lang: defaults.lang.clone(),
            proxy_server: defaults.proxy_server.clone(),
            fingerprint: defaults.fingerprint.clone(),
            timezone: defaults.timezone.clone(),
            custom_args: defaults.custom_args.clone(),
        }
    }
}

/// Build the Chrome command for one profile-bound session.
pub fn build_command(
    chrome_path: &Path,
    user_data_dir: &Path,
    cdp_port: u16,
    opts: &LaunchOptions,
) -> Command {
    let mut cmd = Command::new(chrome_path);

    cmd.arg(format!("--user-data-dir={}", user_data_dir.display()));
    cmd.arg(format!("--remote-debugging-port={}", cdp_port));

    if opts.headless {
        cmd.arg("--headless=new");
    }

    cmd.arg(format!(
        "--window-size={},{}",
        opts.viewport.0, opts.viewport.1
    ));

    cmd.arg("--no-first-run");
    cmd.arg("--no-default-browser-check");
    cmd.arg("--disable-background-networking");
    cmd.arg("--disable-sync");

    if let Some(proxy) = &opts.proxy_server {
        cmd.arg(format!("--proxy-server={}", proxy));
    }

    cmd.arg(format!("--lang={}", opts.lang));

    if let Some(fp) = &opts.fingerprint {
        cmd.arg(format!("--fingerprint={}", fp));
    }

    if let Some(tz) = &opts.timezone {
        cmd.arg(format!("--timezone={}", tz));
        cmd.env("TZ", tz);
    }

    for arg in &opts.custom_args {
        cmd.arg(arg);
    }

    cmd.arg(&opts.start_url);

    // Detach so the browser survives our own crash (the lock file carries
    // ownership, not the process tree).
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }

    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn opts() -> LaunchOptions {
        LaunchOptions {
            headless: false,
            viewport: (1280, 800),
            start_url: "about:blank".to_string(),
            lang: "zh-CN".to_string(),
            proxy_server: None,
            fingerprint: None,
            timezone: None,
            custom_args: vec![],
        }
    }

    #[test]
    fn test_build_command_basic() {
        let cmd = build_command(
            Path::new("/usr/bin/google-chrome"),
            &PathBuf::from("/tmp/webauto/profiles/xhs_fresh"),
            9222,
            &opts(),
        );
        let args: Vec<String> = cmd
            .get_args()
            .map(|s| s.to_string_lossy().to_string())
            .collect();

        assert!(args.contains(&"--user-data-dir=/tmp/webauto/profiles/xhs_fresh".to_string()));
        assert!(args.contains(&"--remote-debugging-port=9222".to_string()));
        assert!(args.contains(&"--lang=zh-CN".to_string()));
        assert!(args.contains(&"--window-size=1280,800".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("about:blank"));
    }

    #[test]
    fn test_build_command_fingerprint_and_proxy() {
        let mut o = opts();
        o.headless = true;
        o.proxy_server = Some("http://127.0.0.1:8889".to_string());
        o.fingerprint = Some("10032".to_string());
        o.custom_args = vec!["--disable-gpu".to_string()];

        let cmd = build_command(
            Path::new("/usr/bin/google-chrome"),
            &PathBuf::from("/tmp/p"),
            9223,
            &o,
        );
        let args: Vec<String> = cmd
            .get_args()
            .map(|s| s.to_string_lossy().to_string())
            .collect();

        assert!(args.contains(&"--headless=new".to_string()));
        assert!(args.contains(&"--proxy-server=http://127.0.0.1:8889".to_string()));
        assert!(args.contains(&"--fingerprint=10032".to_string()));
        assert!(args.contains(&"--disable-gpu".to_string()));
    }
}
