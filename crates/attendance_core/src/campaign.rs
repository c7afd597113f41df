use log::info;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::batch::{Addressing, AttendanceCutoff, BatchRunner};
use crate::catalog::{CatalogError, Pattern, PatternError, Template, TemplateCatalog, TemplateSpec};
use crate::locale::{Locale, LocaleResolver, UnknownLocale};
use crate::render::{MessageRenderer, PLACEHOLDERS};
use crate::tiers::{TierScheme, TierSchemeError, TierSchemeSpec};

pub const CAMPAIGN_FILE: &str = "campaign.toml";
pub const TEMPLATES_FILE: &str = "templates.yaml";
pub const REMARKS_FILE: &str = "remarks.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid TOML in {}: {source}", path.display())]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid YAML in {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{}: {source}", path.display())]
    Locale {
        path: PathBuf,
        #[source]
        source: UnknownLocale,
    },
    #[error("tier scheme in {}: {source}", path.display())]
    Scheme {
        path: PathBuf,
        #[source]
        source: TierSchemeError,
    },
    #[error("pattern {pattern:?} in {}: {source}", path.display())]
    Pattern {
        path: PathBuf,
        pattern: String,
        #[source]
        source: PatternError,
    },
    #[error("address pattern may only use {{id}}, found {{{0}}}")]
    AddressPlaceholder(String),
    #[error("eligibility cutoff {0} must lie in [0, 1]")]
    Cutoff(f64),
    #[error("campaign in {}: {source}", path.display())]
    Catalog {
        path: PathBuf,
        #[source]
        source: CatalogError,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct CampaignFile {
    general: GeneralSection,
    #[serde(default)]
    eligibility: AttendanceCutoff,
    tiers: TierSchemeSpec,
}

#[derive(Debug, Clone, Deserialize)]
struct GeneralSection {
    name: String,
    default_locale: String,
    /// Relative to the campaign directory.
    locale_table: Option<PathBuf>,
    #[serde(default = "default_pacing_ms")]
    pacing_ms: u64,
    #[serde(default = "default_percent_decimals")]
    percent_decimals: usize,
    address_pattern: Option<String>,
}

fn default_pacing_ms() -> u64 {
    500
}

fn default_percent_decimals() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
struct LocaleTableFile {
    jurisdictions: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TemplatesFile {
    templates: BTreeMap<String, TemplateSpec>,
    /// tier -> locale -> template, for tiers that need their own wording.
    #[serde(default)]
    tier_templates: BTreeMap<String, BTreeMap<String, TemplateSpec>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RemarksFile {
    remarks: HashMap<String, HashMap<String, String>>,
}

/// Everything one notification campaign needs, loaded from a directory.
#[derive(Debug, Clone)]
pub struct Campaign {
    pub name: String,
    pub resolver: LocaleResolver,
    pub scheme: TierScheme,
    pub catalog: TemplateCatalog,
    pub renderer: MessageRenderer,
    pub eligibility: AttendanceCutoff,
    pub addressing: Addressing,
    pub pacing: Duration,
}

impl Campaign {
    pub fn load_from_dir(path: &Path) -> Result<Self, ConfigError> {
        let config_path = path.join(CAMPAIGN_FILE);
        let config: CampaignFile = read_toml(&config_path)?;
        let general = config.general;

        let default_locale = parse_locale(&general.default_locale, &config_path)?;

        let resolver = match &general.locale_table {
            Some(table) => load_locale_table(&path.join(table), default_locale)?,
            None => LocaleResolver::new(default_locale),
        };

        let scheme = TierScheme::try_from(config.tiers).map_err(|source| ConfigError::Scheme {
            path: config_path.clone(),
            source,
        })?;

        if let Some(min) = config.eligibility.min_attendance {
            if !(0.0..=1.0).contains(&min) {
                return Err(ConfigError::Cutoff(min));
            }
        }

        let addressing = match &general.address_pattern {
            Some(source) => {
                let pattern = Pattern::parse(source).map_err(|err| ConfigError::Pattern {
                    path: config_path.clone(),
                    pattern: source.clone(),
                    source: err,
                })?;
                if let Some(other) = pattern.placeholders().find(|name| *name != "id") {
                    return Err(ConfigError::AddressPlaceholder(other.to_string()));
                }
                Addressing::new(Some(pattern))
            }
            None => Addressing::new(None),
        };

        let catalog = load_catalog(path, default_locale, &scheme)?;

        info!(
            "loaded campaign {} ({} locales, tiers: {}, {} jurisdictions mapped)",
            general.name,
            catalog.locales().len(),
            scheme.tier_names().collect::<Vec<_>>().join("/"),
            resolver.len()
        );

        Ok(Self {
            name: general.name,
            resolver,
            scheme,
            catalog,
            renderer: MessageRenderer::new(general.percent_decimals),
            eligibility: config.eligibility,
            addressing,
            pacing: Duration::from_millis(general.pacing_ms),
        })
    }

    pub fn runner(&self) -> BatchRunner<'_> {
        BatchRunner::new(
            &self.resolver,
            &self.scheme,
            &self.catalog,
            &self.renderer,
            &self.addressing,
            &self.eligibility,
            self.pacing,
        )
    }
}

fn load_locale_table(path: &Path, default: Locale) -> Result<LocaleResolver, ConfigError> {
    let file: LocaleTableFile = read_yaml(path)?;
    let mut resolver = LocaleResolver::new(default);
    for (jurisdiction, code) in &file.jurisdictions {
        resolver.insert(jurisdiction, parse_locale(code, path)?);
    }
    Ok(resolver)
}

fn load_catalog(
    dir: &Path,
    default_locale: Locale,
    scheme: &TierScheme,
) -> Result<TemplateCatalog, ConfigError> {
    let templates_path = dir.join(TEMPLATES_FILE);
    let templates: TemplatesFile = read_yaml(&templates_path)?;
    let remarks_path = dir.join(REMARKS_FILE);
    let remarks: RemarksFile = read_yaml(&remarks_path)?;

    let mut builder = TemplateCatalog::builder(default_locale);
    for (code, spec) in &templates.templates {
        let locale = parse_locale(code, &templates_path)?;
        builder = builder.template(locale, None, parse_template(spec, &templates_path)?);
    }
    for (tier, by_locale) in &templates.tier_templates {
        for (code, spec) in by_locale {
            let locale = parse_locale(code, &templates_path)?;
            builder =
                builder.template(locale, Some(tier.as_str()), parse_template(spec, &templates_path)?);
        }
    }
    for (tier, by_locale) in &remarks.remarks {
        for (code, text) in by_locale {
            builder = builder.remark(tier, parse_locale(code, &remarks_path)?, text.as_str());
        }
    }

    builder
        .build(scheme, PLACEHOLDERS)
        .map_err(|source| ConfigError::Catalog {
            path: dir.to_path_buf(),
            source,
        })
}

fn parse_template(spec: &TemplateSpec, path: &Path) -> Result<Template, ConfigError> {
    let subject = Pattern::parse(&spec.subject).map_err(|source| ConfigError::Pattern {
        path: path.to_path_buf(),
        pattern: spec.subject.clone(),
        source,
    })?;
    let body = Pattern::parse(&spec.body).map_err(|source| ConfigError::Pattern {
        path: path.to_path_buf(),
        pattern: spec.body.clone(),
        source,
    })?;
    Ok(Template { subject, body })
}

fn parse_locale(code: &str, path: &Path) -> Result<Locale, ConfigError> {
    code.parse().map_err(|source| ConfigError::Locale {
        path: path.to_path_buf(),
        source,
    })
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    toml::from_str(&read(path)?).map_err(|source| ConfigError::Toml {
        path: path.to_path_buf(),
        source,
    })
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    serde_yaml::from_str(&read(path)?).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}
