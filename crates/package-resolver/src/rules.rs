//! Static resolution rules, keyed by version and by target/profile.
//!
//! Version keys are prefixes: `"24.10"` covers `24.10.0` and point
//! releases. `SNAPSHOT` matches exactly. Rules carry everything needed to
//! explain themselves in the change log.

/// A package renamed between versions.
pub struct Rename {
    pub from: &'static str,
    pub to: &'static str,
    pub versions: &'static [&'static str],
}

/// A family of packages renamed by prefix, preserving the suffix.
/// Used to collapse per-language variant packages onto a new base name.
pub struct PrefixRename {
    pub from_prefix: &'static str,
    pub to_prefix: &'static str,
    pub versions: &'static [&'static str],
}

/// Packages a device needs that are not part of its defaults.
pub struct HardwareAddition {
    pub versions: &'static [&'static str],
    pub target: &'static str,
    /// Empty means every profile of the target.
    pub profiles: &'static [&'static str],
    pub packages: &'static [&'static str],
}

pub const RENAMES: &[Rename] = &[
    Rename {
        from: "auc",
        to: "owut",
        versions: &["24.10", "25.12", "SNAPSHOT"],
    },
    // luci-ssl is deprecated; the nginx variant replaces it.
    Rename {
        from: "luci-ssl",
        to: "luci-ssl-nginx",
        versions: &["24.10", "25.12", "SNAPSHOT"],
    },
];

pub const LANGUAGE_PACK_RENAMES: &[PrefixRename] = &[PrefixRename {
    from_prefix: "luci-i18n-opkg-",
    to_prefix: "luci-i18n-package-manager-",
    versions: &["24.10", "25.12", "SNAPSHOT"],
}];

pub const HARDWARE_ADDITIONS: &[HardwareAddition] = &[
    HardwareAddition {
        versions: &["23.05"],
        target: "mediatek/mt7622",
        profiles: &[],
        packages: &["kmod-mt7622-firmware"],
    },
    HardwareAddition {
        versions: &["23.05"],
        target: "ath79/generic",
        profiles: &[
            "buffalo_wzr-hp-g300nh-s",
            "dlink_dir-825-b1",
            "netgear_wndr3700",
            "netgear_wndr3700-v2",
            "netgear_wndr3800",
            "netgear_wndr3800ch",
            "netgear_wndrmac-v1",
            "netgear_wndrmac-v2",
            "trendnet_tew-673gru",
        ],
        packages: &["kmod-switch-rtl8366s"],
    },
    HardwareAddition {
        versions: &["23.05"],
        target: "ath79/generic",
        profiles: &["buffalo_wzr-hp-g300nh-rb"],
        packages: &["kmod-switch-rtl8366rb"],
    },
    // Devices migrated from swconfig to DSA need the switch driver
    // spelled out.
    HardwareAddition {
        versions: &["25.12"],
        target: "kirkwood/generic",
        profiles: &[
            "checkpoint_l-50",
            "endian_4i-edge-200",
            "linksys_e4200-v2",
            "linksys_ea3500",
            "linksys_ea4500",
        ],
        packages: &["kmod-dsa-mv88e6xxx"],
    },
    HardwareAddition {
        versions: &["25.12"],
        target: "mvebu/cortexa9",
        profiles: &[
            "cznic_turris-omnia",
            "linksys_wrt1200ac",
            "linksys_wrt3200acm",
        ],
        packages: &["kmod-dsa-mv88e6xxx"],
    },
    // The two lantiq PHY variants take different firmware pairs.
    HardwareAddition {
        versions: &["25.12"],
        target: "lantiq/xrx200",
        profiles: &[
            "arcadyan_arv7519rw22",
            "arcadyan_vgv7510kw22-brn",
            "avm_fritz7412",
        ],
        packages: &[
            "xrx200-rev1.1-phy22f-firmware",
            "xrx200-rev1.2-phy22f-firmware",
        ],
    },
    HardwareAddition {
        versions: &["25.12"],
        target: "lantiq/xrx200",
        profiles: &["tplink_vr200", "avm_fritz7490", "bt_homehub-v5a"],
        packages: &[
            "xrx200-rev1.1-phy11g-firmware",
            "xrx200-rev1.2-phy11g-firmware",
        ],
    },
    HardwareAddition {
        versions: &["25.12"],
        target: "bcm53xx/generic",
        profiles: &["meraki_mr32"],
        packages: &["kmod-hci-uart"],
    },
    HardwareAddition {
        versions: &["25.12"],
        target: "ipq40xx/generic",
        profiles: &["linksys_whw03"],
        packages: &["kmod-hci-uart"],
    },
];

/// Whether `version` falls under any of the rule's version keys.
pub fn version_matches(version: &str, keys: &[&str]) -> bool {
    keys.iter().any(|key| {
        if *key == "SNAPSHOT" {
            version == "SNAPSHOT"
        } else {
            version.starts_with(key)
        }
    })
}

/// Human-readable reason for an automatic addition, classified by what
/// kind of package it is.
pub fn addition_reason(package: &str, target: &str, profile: &str) -> String {
    if package.starts_with("kmod-") {
        format!("kernel module required by profile {profile} on {target}")
    } else if package.ends_with("-firmware") {
        format!("device firmware required by profile {profile} on {target}")
    } else if package.starts_with("luci-i18n-") {
        format!("language pack required by profile {profile} on {target}")
    } else {
        format!("required by profile {profile} on {target}")
    }
}
