use crate::error::{Result, WebautoError};
use std::path::Path;

/// Profile ids are `{platform}_{variant}` with an optional two-digit
/// counter, e.g. `xiaohongshu_fresh` or `weibo_main_02`. All segments are
/// lowercase alphanumeric.
pub fn validate_profile_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(WebautoError::Validation("Profile id is empty".to_string()));
    }

    let segments: Vec<&str> = id.split('_').collect();
    if segments.len() < 2 {
        return Err(WebautoError::Validation(format!(
            "Profile id '{}' must be platform_variant[_NN]",
            id
        )));
    }

    for seg in &segments {
        if seg.is_empty() || !seg.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
            return Err(WebautoError::Validation(format!(
                "Profile id '{}' has invalid segment '{}'",
                id, seg
            )));
        }
    }

    // A trailing numeric segment is the instance counter and must be two digits.
    if segments.len() > 2 {
        let last = segments[segments.len() - 1];
        if last.chars().all(|c| c.is_ascii_digit()) && last.len() != 2 {
            return Err(WebautoError::Validation(format!(
                "Profile id '{}' counter segment must be two digits",
                id
            )));
        }
    }

    Ok(())
}

/// The platform prefix of a profile id (`xiaohongshu_fresh` → `xiaohongshu`).
pub fn platform_of(profile_id: &str) -> &str {
    profile_id.split('_').next().unwrap_or(profile_id)
}

/// Validate that the Chrome path exists and looks executable.
pub fn validate_chrome_path(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(WebautoError::Validation(format!(
            "Chrome executable not found at {:?}",
            path
        )));
    }
    if !path.is_file() {
        return Err(WebautoError::Validation(format!(
            "Chrome path {:?} is not a file",
            path
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_profile_ids() {
        validate_profile_id("xiaohongshu_fresh").unwrap();
        validate_profile_id("weibo_main").unwrap();
        validate_profile_id("xhs_batch_02").unwrap();
    }

    #[test]
    fn test_invalid_profile_ids() {
        assert!(validate_profile_id("").is_err());
        assert!(validate_profile_id("single").is_err());
        assert!(validate_profile_id("Upper_case").is_err());
        assert!(validate_profile_id("xhs__double").is_err());
        assert!(validate_profile_id("xhs_fresh_1").is_err());
        assert!(validate_profile_id("xhs-fresh").is_err());
    }

    #[test]
    fn test_platform_prefix() {
        assert_eq!(platform_of("xiaohongshu_fresh"), "xiaohongshu");
        assert_eq!(platform_of("weibo_main_02"), "weibo");
    }
}
