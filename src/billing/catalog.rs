use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::replies::Locale;

/// Currency code for Telegram Stars.
pub const STARS_CURRENCY: &str = "XTR";

/// Longest validity window a tariff may declare (100 years).
pub const MAX_VALIDITY_SECONDS: i64 = 3_155_760_000;

/// key: tariff-grant-size -> count or explicit unlimited tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "GrantSizeRepr", into = "GrantSizeRepr")]
pub enum GrantSize {
    Limited(i64),
    Unlimited,
}

impl GrantSize {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, GrantSize::Unlimited)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum GrantSizeRepr {
    Count(i64),
    Label(String),
}

impl TryFrom<GrantSizeRepr> for GrantSize {
    type Error = String;

    fn try_from(value: GrantSizeRepr) -> Result<Self, Self::Error> {
        match value {
            GrantSizeRepr::Count(count) => Ok(GrantSize::Limited(count)),
            GrantSizeRepr::Label(label) if label.eq_ignore_ascii_case("unlimited") => {
                Ok(GrantSize::Unlimited)
            }
            GrantSizeRepr::Label(other) => Err(format!(
                "grant must be a positive count or \"unlimited\", got \"{other}\""
            )),
        }
    }
}

impl From<GrantSize> for GrantSizeRepr {
    fn from(value: GrantSize) -> Self {
        match value {
            GrantSize::Limited(count) => GrantSizeRepr::Count(count),
            GrantSize::Unlimited => GrantSizeRepr::Label("unlimited".to_string()),
        }
    }
}

/// key: tariff-model -> purchasable plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tariff {
    pub code: String,
    #[serde(default)]
    pub name: String,
    /// Russian display name; `name` is used when absent.
    #[serde(default)]
    pub name_ru: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub description_ru: Option<String>,
    pub price: i64,
    pub grant: GrantSize,
    #[serde(default)]
    pub validity_seconds: Option<i64>,
}

impl Tariff {
    pub fn display_name(&self, locale: Locale) -> &str {
        localized(locale, &self.name, self.name_ru.as_deref())
    }

    pub fn display_description(&self, locale: Locale) -> &str {
        localized(locale, &self.description, self.description_ru.as_deref())
    }
}

fn localized<'a>(locale: Locale, default: &'a str, russian: Option<&'a str>) -> &'a str {
    match (locale, russian) {
        (Locale::Ru, Some(text)) if !text.trim().is_empty() => text,
        _ => default,
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("tariff catalog is empty")]
    Empty,
    #[error("tariff code must not be blank")]
    BlankCode,
    #[error("tariff code `{0}` may only contain ASCII letters and digits")]
    InvalidCode(String),
    #[error("duplicate tariff code `{0}`")]
    DuplicateCode(String),
    #[error("tariff `{code}` must have a positive price, got {price}")]
    InvalidPrice { code: String, price: i64 },
    #[error("tariff `{code}` must grant a positive number of checks, got {count}")]
    InvalidGrant { code: String, count: i64 },
    #[error("tariff `{code}` validity must be between 1s and 100 years, got {seconds}s")]
    InvalidValidity { code: String, seconds: i64 },
    #[error("failed to parse tariff catalog: {0}")]
    Parse(String),
}

/// key: tariff-catalog -> immutable plan lookup
///
/// Built once at startup and shared by reference; nothing mutates it afterwards.
#[derive(Debug, Clone)]
pub struct TariffCatalog {
    currency: String,
    tariffs: Vec<Tariff>,
}

impl TariffCatalog {
    /// The LITE / MAX / ULTRA plans sold through the bot.
    pub fn builtin() -> Self {
        let tariffs = vec![
            Tariff {
                code: "LITE".to_string(),
                name: "LITE".to_string(),
                name_ru: Some("ЛАЙТ".to_string()),
                description: "10 photo checks".to_string(),
                description_ru: Some("10 проверок фото".to_string()),
                price: 1,
                grant: GrantSize::Limited(10),
                validity_seconds: None,
            },
            Tariff {
                code: "MAX".to_string(),
                name: "MAX".to_string(),
                name_ru: Some("МАКС".to_string()),
                description: "Unlimited checks for 48 hours".to_string(),
                description_ru: Some("Безлимитные проверки на 48 часов".to_string()),
                price: 1,
                grant: GrantSize::Unlimited,
                validity_seconds: Some(172_800),
            },
            Tariff {
                code: "ULTRA".to_string(),
                name: "ULTRA".to_string(),
                name_ru: Some("УЛЬТРА".to_string()),
                description: "Unlimited checks for 6 months".to_string(),
                description_ru: Some("Безлимитные проверки на 6 месяцев".to_string()),
                price: 1,
                grant: GrantSize::Unlimited,
                validity_seconds: Some(15_552_000),
            },
        ];
        Self {
            currency: STARS_CURRENCY.to_string(),
            tariffs,
        }
    }

    pub fn from_tariffs(tariffs: Vec<Tariff>) -> Result<Self, CatalogError> {
        if tariffs.is_empty() {
            return Err(CatalogError::Empty);
        }

        let mut seen = HashSet::new();
        let mut normalized = Vec::with_capacity(tariffs.len());
        for mut tariff in tariffs {
            let code = tariff.code.trim().to_ascii_uppercase();
            if code.is_empty() {
                return Err(CatalogError::BlankCode);
            }
            // Codes are embedded in invoice payloads, which split on `_`.
            if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(CatalogError::InvalidCode(code));
            }
            if !seen.insert(code.clone()) {
                return Err(CatalogError::DuplicateCode(code));
            }
            if tariff.price <= 0 {
                return Err(CatalogError::InvalidPrice {
                    code,
                    price: tariff.price,
                });
            }
            if let GrantSize::Limited(count) = tariff.grant {
                if count <= 0 {
                    return Err(CatalogError::InvalidGrant { code, count });
                }
            }
            if let Some(seconds) = tariff.validity_seconds {
                if seconds <= 0 || seconds > MAX_VALIDITY_SECONDS {
                    return Err(CatalogError::InvalidValidity { code, seconds });
                }
            }
            if tariff.name.trim().is_empty() {
                tariff.name = code.clone();
            }
            tariff.code = code;
            normalized.push(tariff);
        }

        Ok(Self {
            currency: STARS_CURRENCY.to_string(),
            tariffs: normalized,
        })
    }

    /// Parses a JSON array of tariffs, e.g.
    /// `[{"code": "LITE", "price": 1, "grant": 10}, {"code": "MAX", "price": 5, "grant": "unlimited", "validity_seconds": 172800}]`.
    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let tariffs: Vec<Tariff> =
            serde_json::from_str(raw).map_err(|err| CatalogError::Parse(err.to_string()))?;
        Self::from_tariffs(tariffs)
    }

    pub fn lookup(&self, code: &str) -> Option<&Tariff> {
        let code = code.trim();
        self.tariffs
            .iter()
            .find(|tariff| tariff.code.eq_ignore_ascii_case(code))
    }

    pub fn tariffs(&self) -> &[Tariff] {
        &self.tariffs
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_resolves_known_codes() {
        let catalog = TariffCatalog::builtin();

        let lite = catalog.lookup("LITE").expect("LITE should exist");
        assert_eq!(lite.price, 1);
        assert_eq!(lite.grant, GrantSize::Limited(10));
        assert_eq!(lite.validity_seconds, None);

        let max = catalog.lookup("max").expect("lookup is case-insensitive");
        assert!(max.grant.is_unlimited());
        assert_eq!(max.validity_seconds, Some(172_800));

        assert!(catalog.lookup("UNKNOWN").is_none());
        assert_eq!(catalog.currency(), "XTR");
    }

    #[test]
    fn json_catalog_accepts_unlimited_label() {
        let catalog = TariffCatalog::from_json(
            r#"[
                {"code": "lite", "price": 2, "grant": 5},
                {"code": "Week", "price": 7, "grant": "unlimited", "validity_seconds": 604800}
            ]"#,
        )
        .unwrap();

        let codes: Vec<_> = catalog.tariffs().iter().map(|t| t.code.as_str()).collect();
        assert_eq!(codes, vec!["LITE", "WEEK"]);
        let week = catalog.lookup("WEEK").unwrap();
        assert_eq!(week.grant, GrantSize::Unlimited);
        assert_eq!(week.name, "WEEK");
    }

    #[test]
    fn invalid_catalogs_are_rejected() {
        let duplicate = TariffCatalog::from_json(
            r#"[{"code": "A", "price": 1, "grant": 1}, {"code": "a", "price": 1, "grant": 2}]"#,
        );
        assert_eq!(
            duplicate.unwrap_err(),
            CatalogError::DuplicateCode("A".to_string())
        );

        let free = TariffCatalog::from_json(r#"[{"code": "A", "price": 0, "grant": 1}]"#);
        assert!(matches!(free, Err(CatalogError::InvalidPrice { .. })));

        let empty_grant = TariffCatalog::from_json(r#"[{"code": "A", "price": 1, "grant": 0}]"#);
        assert!(matches!(empty_grant, Err(CatalogError::InvalidGrant { .. })));

        let bad_label = TariffCatalog::from_json(r#"[{"code": "A", "price": 1, "grant": "lots"}]"#);
        assert!(matches!(bad_label, Err(CatalogError::Parse(_))));

        assert_eq!(TariffCatalog::from_json("[]").unwrap_err(), CatalogError::Empty);
    }

    #[test]
    fn codes_outside_payload_alphabet_are_rejected() {
        let underscored =
            TariffCatalog::from_json(r#"[{"code": "pro_plus", "price": 1, "grant": 1}]"#);
        assert_eq!(
            underscored.unwrap_err(),
            CatalogError::InvalidCode("PRO_PLUS".to_string())
        );

        let spaced = TariffCatalog::from_json(r#"[{"code": "PRO PLUS", "price": 1, "grant": 1}]"#);
        assert!(matches!(spaced, Err(CatalogError::InvalidCode(_))));
    }

    #[test]
    fn oversized_validity_is_rejected() {
        let huge = TariffCatalog::from_json(
            r#"[{"code": "FOREVER", "price": 1, "grant": "unlimited", "validity_seconds": 9000000000000000}]"#,
        );
        assert_eq!(
            huge.unwrap_err(),
            CatalogError::InvalidValidity {
                code: "FOREVER".to_string(),
                seconds: 9_000_000_000_000_000,
            }
        );

        let century = TariffCatalog::from_json(&format!(
            r#"[{{"code": "CENTURY", "price": 1, "grant": 1, "validity_seconds": {MAX_VALIDITY_SECONDS}}}]"#
        ));
        assert!(century.is_ok());
    }

    #[test]
    fn russian_names_are_optional() {
        let catalog = TariffCatalog::builtin();
        let lite = catalog.lookup("LITE").unwrap();
        assert_eq!(lite.display_name(Locale::Ru), "ЛАЙТ");
        assert_eq!(lite.display_name(Locale::En), "LITE");
        assert_eq!(lite.display_description(Locale::Ru), "10 проверок фото");

        let custom = TariffCatalog::from_json(
            r#"[{"code": "a", "price": 1, "grant": 1, "description": "one check"}]"#,
        )
        .unwrap();
        let plain = custom.lookup("A").unwrap();
        assert_eq!(plain.name_ru, None);
        assert_eq!(plain.display_name(Locale::Ru), "A");
        assert_eq!(plain.display_description(Locale::Ru), "one check");
    }
}
