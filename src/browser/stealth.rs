use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;

/// Desktop user agent paired with the language header a real browser sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderProfile {
    pub user_agent: &'static str,
    pub accept_language: &'static str,
    pub platform: &'static str,
}

const HEADER_PROFILES: &[HeaderProfile] = &[
    HeaderProfile {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
        accept_language: "en-US,en;q=0.9",
        platform: "Win32",
    },
    HeaderProfile {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
        accept_language: "en-US,en;q=0.9",
        platform: "MacIntel",
    },
    HeaderProfile {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_5) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15",
        accept_language: "en-US,en;q=0.8",
        platform: "MacIntel",
    },
    HeaderProfile {
        user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
        accept_language: "en-US,en;q=0.9",
        platform: "Linux x86_64",
    },
    HeaderProfile {
        user_agent: "Mozilla/5.0 (X11; Linux x86_64; rv:126.0) Gecko/20100101 Firefox/126.0",
        accept_language: "en-US,en;q=0.7",
        platform: "Linux x86_64",
    },
];

/// Rotating pool of desktop header profiles.
#[derive(Debug, Clone)]
pub struct UserAgentGenerator {
    profiles: &'static [HeaderProfile],
}

impl Default for UserAgentGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl UserAgentGenerator {
    pub fn new() -> Self {
        Self {
            profiles: HEADER_PROFILES,
        }
    }

    pub fn random_profile(&self) -> &HeaderProfile {
        let mut rng = rand::thread_rng();
        self.profiles.choose(&mut rng).unwrap_or(&HEADER_PROFILES[0])
    }

    pub fn default_profile(&self) -> &HeaderProfile {
        self.profiles.first().unwrap_or(&HEADER_PROFILES[0])
    }

    /// Chromium-family profiles only, for the automated browser.
    pub fn random_chromium_profile(&self) -> &HeaderProfile {
        let chromium: Vec<&HeaderProfile> = self
            .profiles
            .iter()
            .filter(|p| p.user_agent.contains("Chrome/"))
            .collect();
        let mut rng = rand::thread_rng();
        chromium.choose(&mut rng).copied().unwrap_or(&HEADER_PROFILES[0])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportSize {
    pub width: u32,
    pub height: u32,
}

const VIEWPORTS: &[ViewportSize] = &[
    ViewportSize { width: 1920, height: 1080 },
    ViewportSize { width: 1366, height: 768 },
    ViewportSize { width: 1536, height: 864 },
    ViewportSize { width: 1440, height: 900 },
    ViewportSize { width: 1600, height: 900 },
];

const TIMEZONES: &[&str] = &[
    "America/New_York",
    "America/Chicago",
    "America/Denver",
    "America/Los_Angeles",
];

pub struct FingerprintRandomizer;

impl FingerprintRandomizer {
    pub fn new() -> Self {
        Self
    }

    /// Fingerprint consistent with the header profile it will travel with.
    pub fn generate_fingerprint(&self, profile: &HeaderProfile) -> BrowserFingerprint {
        let mut rng = rand::thread_rng();
        BrowserFingerprint {
            viewport: *VIEWPORTS.choose(&mut rng).unwrap_or(&VIEWPORTS[0]),
            language: profile.accept_language.to_string(),
            timezone: TIMEZONES.choose(&mut rng).unwrap_or(&TIMEZONES[0]).to_string(),
            platform: profile.platform.to_string(),
            hardware_concurrency: [4, 8, 12, 16][rng.gen_range(0..4)],
            device_memory: [4, 8, 16][rng.gen_range(0..3)],
        }
    }
}

impl Default for FingerprintRandomizer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserFingerprint {
    pub viewport: ViewportSize,
    pub language: String,
    pub timezone: String,
    pub platform: String,
    pub hardware_concurrency: u32,
    pub device_memory: u32,
}

impl BrowserFingerprint {
    /// Language tags without q-values, e.g. `["en-US", "en"]`.
    pub fn languages(&self) -> Vec<String> {
        self.language
            .split(',')
            .map(|tag| tag.split(';').next().unwrap_or(tag).trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect()
    }

    /// Navigator getters, keyed by property name, as JavaScript literals.
    pub fn navigator_overrides(&self) -> BTreeMap<&'static str, String> {
        let languages = self.languages();
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "language",
            format!("'{}'", languages.first().map(String::as_str).unwrap_or("en-US")),
        );
        overrides.insert(
            "languages",
            format!(
                "[{}]",
                languages.iter().map(|l| format!("'{}'", l)).collect::<Vec<_>>().join(", ")
            ),
        );
        overrides.insert("platform", format!("'{}'", self.platform));
        overrides.insert("hardwareConcurrency", self.hardware_concurrency.to_string());
        overrides.insert("deviceMemory", self.device_memory.to_string());
        overrides.insert("webdriver", "undefined".to_string());
        overrides
    }
}

/// Script registered to run before any page script on every navigation.
pub fn generate_stealth_script(fingerprint: &BrowserFingerprint) -> String {
    let mut script = String::from("(() => {\n");

    for (property, value) in fingerprint.navigator_overrides() {
        script.push_str(&format!(
            "    Object.defineProperty(Navigator.prototype, '{}', {{ get: () => {}, configurable: true }});\n",
            property, value
        ));
    }

    script.push_str(
        r#"    Object.defineProperty(Navigator.prototype, 'plugins', {
        get: () => [
            { name: 'Chrome PDF Plugin', filename: 'internal-pdf-viewer' },
            { name: 'Chrome PDF Viewer', filename: 'mhjfbmdgcfjbbpaeojofohoefgiehjai' },
        ],
        configurable: true
    });
    window.chrome = window.chrome || { runtime: {} };
    if (navigator.permissions && navigator.permissions.query) {
        const originalQuery = navigator.permissions.query.bind(navigator.permissions);
        navigator.permissions.query = (parameters) =>
            parameters && parameters.name === 'notifications'
                ? Promise.resolve({ state: Notification.permission })
                : originalQuery(parameters);
    }
    for (const key of Object.keys(window)) {
        if (key.startsWith('cdc_')) { delete window[key]; }
    }
"#,
    );

    script.push_str("})();\n");
    script
}
