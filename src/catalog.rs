//! The catalog: vendors in rotation order and their schedulable combinations.
//!
//! A combination is one (vendor, image, test) triple, the atomic unit of
//! scheduling. The catalog is read-only once built; disabled images are
//! dropped at build time so later stages never see them.

use std::collections::HashMap;

use crate::config::{test_fits_image, Config, ImageConfig, TestConfig};

/// Result type for catalog lookups.
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Errors from catalog lookups.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("unknown vendor: {0}")]
    UnknownVendor(String),
}

/// One schedulable (vendor, image, test) triple.
#[derive(Debug, Clone)]
pub struct Combination {
    /// Owning vendor.
    pub vendor: String,
    /// The guest image to boot.
    pub image: ImageConfig,
    /// The test to run inside it.
    pub test: TestConfig,
}

impl Combination {
    /// Stable identifier used as the rotation-state key.
    ///
    /// Image names are unique across the catalog, so image + test is enough
    /// to identify a combination without the vendor.
    pub fn id(&self) -> String {
        format!("{}::{}", self.image.name, self.test.name)
    }
}

/// Read-only view over vendors, images, and tests.
pub struct Catalog {
    vendors: Vec<String>,
    combinations: HashMap<String, Vec<Combination>>,
}

impl Catalog {
    /// Build the catalog from a loaded config.
    ///
    /// Combinations are ordered by image declaration order, then test
    /// declaration order, which keeps rotation deterministic for a given
    /// config file.
    pub fn new(config: &Config) -> Self {
        let vendors: Vec<String> = config.vendors.iter().map(|v| v.name.clone()).collect();
        let mut combinations: HashMap<String, Vec<Combination>> =
            vendors.iter().map(|v| (v.clone(), Vec::new())).collect();

        for image in config.images.iter().filter(|i| i.enabled) {
            let Some(bucket) = combinations.get_mut(&image.vendor) else {
                continue;
            };
            for test in &config.tests {
                if test_fits_image(test, image) {
                    bucket.push(Combination {
                        vendor: image.vendor.clone(),
                        image: image.clone(),
                        test: test.clone(),
                    });
                }
            }
        }

        Self {
            vendors,
            combinations,
        }
    }

    /// Vendor names in rotation order.
    pub fn vendors(&self) -> &[String] {
        &self.vendors
    }

    /// All combinations for a vendor, in catalog order.
    pub fn combinations_for(&self, vendor: &str) -> CatalogResult<&[Combination]> {
        self.combinations
            .get(vendor)
            .map(|c| c.as_slice())
            .ok_or_else(|| CatalogError::UnknownVendor(vendor.to_string()))
    }

    /// Whether a named image and test are compatible.
    pub fn is_compatible(&self, image: &str, test: &str) -> bool {
        self.combinations.values().flatten().any(|combination| {
            combination.image.name == image && combination.test.name == test
        })
    }

    /// Total number of combinations across all vendors.
    pub fn len(&self) -> usize {
        self.combinations.values().map(Vec::len).sum()
    }

    /// True when no vendor has any combination.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;

    fn fixture() -> Config {
        load_config_str(
            r#"
            [[vendors]]
            name = "redhat"

            [[vendors]]
            name = "suse"

            [[images]]
            name = "redhat_rhel4u7_64b.qcow2"
            vendor = "redhat"
            arch = "x86_64"
            os_family = "linux"

            [[images]]
            name = "suse_sles10_64b.qcow2"
            vendor = "suse"
            arch = "x86_64"
            os_family = "linux"

            [[images]]
            name = "suse_sles9_32b.qcow2"
            vendor = "suse"
            arch = "i686"
            os_family = "linux"
            enabled = false

            [[tests]]
            name = "kernbench"
            command = "loop_kernbench"
            os_family = "linux"

            [[tests]]
            name = "LTP"
            command = "run_ltp"
            os_family = "linux"

            [[tests]]
            name = "WinSST"
            command = "run_sst.bat"
            os_family = "windows"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_vendors_keep_declared_order() {
        let catalog = Catalog::new(&fixture());
        assert_eq!(catalog.vendors(), ["redhat", "suse"]);
    }

    #[test]
    fn test_combinations_cross_images_with_compatible_tests() {
        let catalog = Catalog::new(&fixture());
        let combos = catalog.combinations_for("redhat").unwrap();
        let ids: Vec<String> = combos.iter().map(Combination::id).collect();
        assert_eq!(
            ids,
            [
                "redhat_rhel4u7_64b.qcow2::kernbench",
                "redhat_rhel4u7_64b.qcow2::LTP"
            ]
        );
    }

    #[test]
    fn test_disabled_images_are_excluded() {
        let catalog = Catalog::new(&fixture());
        let combos = catalog.combinations_for("suse").unwrap();
        assert!(combos.iter().all(|c| c.image.name != "suse_sles9_32b.qcow2"));
        assert_eq!(combos.len(), 2);
    }

    #[test]
    fn test_incompatible_os_family_is_excluded() {
        let catalog = Catalog::new(&fixture());
        assert!(!catalog.is_compatible("redhat_rhel4u7_64b.qcow2", "WinSST"));
        assert!(catalog.is_compatible("redhat_rhel4u7_64b.qcow2", "LTP"));
    }

    #[test]
    fn test_unknown_vendor_is_an_error() {
        let catalog = Catalog::new(&fixture());
        let err = catalog.combinations_for("microsoft").unwrap_err();
        assert!(matches!(err, CatalogError::UnknownVendor(v) if v == "microsoft"));
    }
}
