// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Candidate URL construction.

use url::Url;

use crate::resource::{DownloadOptions, Version};

/// Suffix of packed archives.
pub const PACK_SUFFIX: &str = ".pack.gz";

/// Separator between a file stem and its embedded version.
pub const VERSION_MARKER: &str = "__V";

/// Query parameter naming the requested version.
pub const VERSION_QUERY: &str = "version-id";

/// Candidate URLs for a location, most specific first, without duplicates:
///
/// 1. `<stem>__V<version><ext>.pack.gz`
/// 2. `<name>.pack.gz`
/// 3. `<stem>__V<version><ext>`
/// 4. `<location>?version-id=<version>`
/// 5. `<location>`
pub fn candidates(location: &Url, version: Option<&Version>, options: DownloadOptions) -> Vec<Url> {
    let name = last_segment(location);
    let mut urls = Vec::with_capacity(5);

    if let Some(name) = name.as_deref() {
        let versioned = version.map(|v| versioned_name(name, v));
        if options.use_pack && options.use_version {
            if let Some(versioned) = &versioned {
                urls.extend(with_name(location, &format!("{versioned}{PACK_SUFFIX}")));
            }
        }
        if options.use_pack {
            urls.extend(with_name(location, &format!("{name}{PACK_SUFFIX}")));
        }
        if options.use_version {
            if let Some(versioned) = &versioned {
                urls.extend(with_name(location, versioned));
            }
        }
    }
    if let Some(version) = version {
        let mut url = location.clone();
        url.query_pairs_mut().append_pair(VERSION_QUERY, version.as_str());
        urls.push(url);
    }
    urls.push(location.clone());

    let mut unique = Vec::with_capacity(urls.len());
    for url in urls {
        if !unique.contains(&url) {
            unique.push(url);
        }
    }
    unique
}

/// `app.jar` + `1.0` → `app__V1.0.jar`.
fn versioned_name(name: &str, version: &Version) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => {
            format!("{}{VERSION_MARKER}{}{}", &name[..dot], version, &name[dot..])
        }
        _ => format!("{name}{VERSION_MARKER}{version}"),
    }
}

fn last_segment(location: &Url) -> Option<String> {
    let segment = location.path_segments()?.next_back()?;
    (!segment.is_empty()).then(|| segment.to_string())
}

fn with_name(location: &Url, name: &str) -> Option<Url> {
    let mut url = location.clone();
    url.path_segments_mut().ok()?.pop().push(name);
    Some(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: DownloadOptions = DownloadOptions {
        use_pack: true,
        use_version: true,
    };

    fn strings(urls: Vec<Url>) -> Vec<String> {
        urls.into_iter().map(String::from).collect()
    }

    #[test]
    fn test_full_candidate_order() {
        let location = Url::parse("https://example.com/lib/app.jar").unwrap();
        let version = Version::new("1.2");
        assert_eq!(
            strings(candidates(&location, Some(&version), ALL)),
            [
                "https://example.com/lib/app__V1.2.jar.pack.gz",
                "https://example.com/lib/app.jar.pack.gz",
                "https://example.com/lib/app__V1.2.jar",
                "https://example.com/lib/app.jar?version-id=1.2",
                "https://example.com/lib/app.jar",
            ]
        );
    }

    #[test]
    fn test_no_options_no_version() {
        let location = Url::parse("https://example.com/lib/app.jar").unwrap();
        assert_eq!(
            strings(candidates(&location, None, DownloadOptions::NONE)),
            ["https://example.com/lib/app.jar"]
        );
    }

    #[test]
    fn test_version_flag_without_version_is_ignored() {
        let location = Url::parse("https://example.com/app.jar").unwrap();
        assert_eq!(
            strings(candidates(&location, None, ALL)),
            ["https://example.com/app.jar.pack.gz", "https://example.com/app.jar"]
        );
    }

    #[test]
    fn test_existing_query_is_kept() {
        let location = Url::parse("https://example.com/app.jar?arch=x64").unwrap();
        let version = Version::new("2");
        let urls = strings(candidates(&location, Some(&version), DownloadOptions::NONE));
        assert_eq!(urls[0], "https://example.com/app.jar?arch=x64&version-id=2");
    }

    #[test]
    fn test_directory_location_skips_file_variants() {
        let location = Url::parse("https://example.com/lib/").unwrap();
        assert_eq!(
            strings(candidates(&location, None, ALL)),
            ["https://example.com/lib/"]
        );
    }

    #[test]
    fn test_extensionless_name() {
        assert_eq!(versioned_name("README", &Version::new("3")), "README__V3");
        assert_eq!(versioned_name(".hidden", &Version::new("3")), ".hidden__V3");
    }
}
