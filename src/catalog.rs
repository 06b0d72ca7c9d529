//! Search-term catalog: ordered categories, each with ordered terms.
//!
//! On disk the catalog is a JSON object mapping category names to arrays of
//! term strings. Key order in the file is processing order.

use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use crate::model::SearchTerm;

/// Catalog loading errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// File could not be read.
    #[error("failed to read catalog {path}: {source}")]
    Io {
        /// Catalog path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Not valid JSON.
    #[error("catalog is not valid JSON: {0}")]
    Parse(#[source] serde_json::Error),

    /// Valid JSON with the wrong shape.
    #[error("invalid catalog: {reason}")]
    Invalid {
        /// What was wrong.
        reason: String,
    },

    /// `--category` named a category the catalog lacks.
    #[error("unknown category `{name}`; available: {available}")]
    UnknownCategory {
        /// Requested name.
        name: String,
        /// Comma-separated category names.
        available: String,
    },
}

/// One named group of terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    /// Category name.
    pub name: String,
    /// Terms in file order.
    pub terms: Vec<String>,
}

/// Ordered catalog of categories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    categories: Vec<Category>,
}

const BUILTIN: &[(&str, &[&str])] = &[
    (
        "Power_Systems",
        &[
            "data center UPS design guide",
            "data center power distribution unit specification",
            "generator paralleling switchgear manual",
            "data center electrical redundancy tier",
        ],
    ),
    (
        "Cooling_Systems",
        &[
            "data center cooling best practices",
            "hot aisle cold aisle containment guide",
            "computer room air handler maintenance manual",
            "liquid cooling data center white paper",
        ],
    ),
    (
        "Energy_Efficiency",
        &[
            "data center energy efficiency best practices",
            "power usage effectiveness measurement guide",
            "federal data center optimization initiative",
        ],
    ),
    (
        "Networking",
        &[
            "data center network cabling standard",
            "structured cabling installation guide",
            "spine leaf network architecture design",
        ],
    ),
    (
        "Facility_Operations",
        &[
            "data center operations and maintenance guide",
            "data center fire suppression design",
            "data center physical security guidelines",
            "data center commissioning checklist",
        ],
    ),
];

impl Catalog {
    /// Builds a catalog from `(category, terms)` pairs.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Invalid`] when there are no terms at all.
    pub fn new(categories: Vec<Category>) -> Result<Self, CatalogError> {
        let catalog = Self { categories };
        if catalog.term_count() == 0 {
            return Err(CatalogError::Invalid {
                reason: "catalog contains no search terms".to_string(),
            });
        }
        Ok(catalog)
    }

    /// Default data-center documentation catalog.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            categories: BUILTIN
                .iter()
                .map(|(name, terms)| Category {
                    name: (*name).to_string(),
                    terms: terms.iter().map(|t| (*t).to_string()).collect(),
                })
                .collect(),
        }
    }

    /// Parses a catalog JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Parse`] or [`CatalogError::Invalid`].
    pub fn from_json_str(raw: &str) -> Result<Self, CatalogError> {
        let value: Value = serde_json::from_str(raw).map_err(CatalogError::Parse)?;
        let Value::Object(map) = value else {
            return Err(CatalogError::Invalid {
                reason: "top level must be an object of category -> [terms]".to_string(),
            });
        };

        let mut categories = Vec::with_capacity(map.len());
        for (name, terms) in map {
            let Value::Array(items) = terms else {
                return Err(CatalogError::Invalid {
                    reason: format!("category `{name}` must map to an array of strings"),
                });
            };
            let mut parsed = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(term) if !term.trim().is_empty() => {
                        parsed.push(term.trim().to_string());
                    }
                    Value::String(_) => {}
                    other => {
                        return Err(CatalogError::Invalid {
                            reason: format!("category `{name}` has a non-string term: {other}"),
                        });
                    }
                }
            }
            categories.push(Category {
                name,
                terms: parsed,
            });
        }
        Self::new(categories)
    }

    /// Reads and parses a catalog file.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Io`] on read failure, otherwise as
    /// [`Catalog::from_json_str`].
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Keeps only the category called `name` (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::UnknownCategory`] when absent.
    pub fn retain_category(self, name: &str) -> Result<Self, CatalogError> {
        let available = self.category_names().join(", ");
        let kept: Vec<Category> = self
            .categories
            .into_iter()
            .filter(|c| c.name.eq_ignore_ascii_case(name))
            .collect();
        if kept.is_empty() {
            return Err(CatalogError::UnknownCategory {
                name: name.to_string(),
                available,
            });
        }
        Ok(Self { categories: kept })
    }

    /// Categories in order.
    #[must_use]
    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    /// Category names in order.
    #[must_use]
    pub fn category_names(&self) -> Vec<&str> {
        self.categories.iter().map(|c| c.name.as_str()).collect()
    }

    /// Every `(category, term)` pair in processing order.
    #[must_use]
    pub fn terms(&self) -> Vec<SearchTerm> {
        self.categories
            .iter()
            .flat_map(|c| c.terms.iter().map(|t| SearchTerm::new(&c.name, t)))
            .collect()
    }

    /// Total number of terms.
    #[must_use]
    pub fn term_count(&self) -> usize {
        self.categories.iter().map(|c| c.terms.len()).sum()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_file_order_is_processing_order() {
        let catalog = Catalog::from_json_str(
            r#"{"Zeta": ["z1", "z2"], "Alpha": ["a1"], "Mid": []}"#,
        )
        .unwrap();
        assert_eq!(catalog.category_names(), vec!["Zeta", "Alpha", "Mid"]);
        let terms: Vec<String> = catalog
            .terms()
            .iter()
            .map(|t| format!("{}/{}", t.category, t.term))
            .collect();
        assert_eq!(terms, vec!["Zeta/z1", "Zeta/z2", "Alpha/a1"]);
    }

    #[test]
    fn test_rejects_wrong_shapes() {
        assert!(matches!(
            Catalog::from_json_str("[]"),
            Err(CatalogError::Invalid { .. })
        ));
        assert!(matches!(
            Catalog::from_json_str(r#"{"A": "term"}"#),
            Err(CatalogError::Invalid { .. })
        ));
        assert!(matches!(
            Catalog::from_json_str(r#"{"A": [1]}"#),
            Err(CatalogError::Invalid { .. })
        ));
        assert!(matches!(
            Catalog::from_json_str(r#"{"A": ["  "]}"#),
            Err(CatalogError::Invalid { .. })
        ));
        assert!(matches!(
            Catalog::from_json_str("{"),
            Err(CatalogError::Parse(_))
        ));
    }

    #[test]
    fn test_retain_category() {
        let catalog = Catalog::builtin().retain_category("cooling_systems").unwrap();
        assert_eq!(catalog.category_names(), vec!["Cooling_Systems"]);

        let err = Catalog::builtin().retain_category("Plumbing").unwrap_err();
        assert!(err.to_string().contains("Power_Systems"));
    }

    #[test]
    fn test_builtin_catalog_is_populated() {
        let catalog = Catalog::builtin();
        assert!(catalog.term_count() >= 10);
        assert!(catalog.categories().iter().all(|c| !c.terms.is_empty()));
    }
}
