//! Message templates and per-tier remarks, keyed by locale.
//!
//! Templates and remarks live in separate tables so the wording of a tier
//! can change without copying a whole message body per tier. Both fall back
//! to the catalog's default locale; a default locale that cannot serve every
//! tier of the scheme is rejected when the catalog is built, never per message.

use log::debug;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::locale::Locale;
use crate::render::RenderError;
use crate::tiers::TierScheme;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("unterminated placeholder starting at byte {0}")]
    Unterminated(usize),
    #[error("invalid placeholder name {0:?}")]
    InvalidName(String),
    #[error("unmatched `}}` at byte {0}")]
    UnmatchedBrace(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// Text with `{name}` placeholders. `{{` and `}}` stand for literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    source: String,
    segments: Vec<Segment>,
}

impl Pattern {
    pub fn parse(source: &str) -> Result<Self, PatternError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((at, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    literal.push('{');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        return Err(PatternError::Unterminated(at));
                    }
                    if !is_identifier(&name) {
                        return Err(PatternError::InvalidName(name));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(name));
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(PatternError::UnmatchedBrace(at)),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Placeholder(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Substitutes every placeholder; the first one without a binding fails.
    pub fn render(&self, bindings: &BTreeMap<&str, String>) -> Result<String, RenderError> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => match bindings.get(name.as_str()) {
                    Some(value) => out.push_str(value),
                    None => {
                        return Err(RenderError::MissingField {
                            field: name.clone(),
                        });
                    }
                },
            }
        }
        Ok(out)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Subject and body of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub subject: Pattern,
    pub body: Pattern,
}

impl Template {
    pub fn parse(subject: &str, body: &str) -> Result<Self, PatternError> {
        Ok(Self {
            subject: Pattern::parse(subject)?,
            body: Pattern::parse(body)?,
        })
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.subject.placeholders().chain(self.body.placeholders())
    }
}

/// Unparsed template text as it appears in `templates.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateSpec {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("default locale {locale} has no template for tier `{tier}`")]
    MissingDefaultTemplate { locale: Locale, tier: String },
    #[error("default locale {locale} has no remark for tier `{tier}`")]
    MissingDefaultRemark { locale: Locale, tier: String },
    #[error("catalog refers to tier `{0}`, which the tier scheme does not define")]
    UnknownTier(String),
    #[error("template for {locale} uses placeholder `{placeholder}`, which is never bound")]
    UnknownPlaceholder { locale: Locale, placeholder: String },
    #[error("no template for tier `{tier}` in {locale} or the default locale")]
    TemplateNotFound { locale: Locale, tier: String },
    #[error("no remark for tier `{tier}` in {locale} or the default locale")]
    RemarkNotFound { locale: Locale, tier: String },
}

type TemplateKey = (Locale, Option<String>);

#[derive(Debug, Clone)]
pub struct CatalogBuilder {
    default_locale: Locale,
    templates: HashMap<TemplateKey, Template>,
    remarks: HashMap<String, HashMap<Locale, String>>,
}

impl CatalogBuilder {
    /// Registers a template for `locale`. With `tier = None` it serves every
    /// tier of that locale that has no tier-specific template.
    pub fn template(mut self, locale: Locale, tier: Option<&str>, template: Template) -> Self {
        self.templates
            .insert((locale, tier.map(str::to_string)), template);
        self
    }

    pub fn remark(mut self, tier: &str, locale: Locale, text: impl Into<String>) -> Self {
        self.remarks
            .entry(tier.to_string())
            .or_default()
            .insert(locale, text.into());
        self
    }

    /// Validates the catalog against `scheme` and the placeholders the
    /// renderer can bind.
    pub fn build(
        self,
        scheme: &TierScheme,
        known_placeholders: &[&str],
    ) -> Result<TemplateCatalog, CatalogError> {
        let catalog = TemplateCatalog {
            default_locale: self.default_locale,
            templates: self.templates,
            remarks: self.remarks,
        };

        for ((locale, tier), template) in &catalog.templates {
            if let Some(tier) = tier {
                if !scheme.contains(tier) {
                    return Err(CatalogError::UnknownTier(tier.clone()));
                }
            }
            if let Some(placeholder) = template
                .placeholders()
                .find(|name| !known_placeholders.iter().any(|known| known == name))
            {
                return Err(CatalogError::UnknownPlaceholder {
                    locale: *locale,
                    placeholder: placeholder.to_string(),
                });
            }
        }
        if let Some(tier) = catalog.remarks.keys().find(|tier| !scheme.contains(tier)) {
            return Err(CatalogError::UnknownTier(tier.clone()));
        }

        let default = catalog.default_locale;
        for tier in scheme.tier_names() {
            if catalog.lookup_template(default, tier).is_none() {
                return Err(CatalogError::MissingDefaultTemplate {
                    locale: default,
                    tier: tier.to_string(),
                });
            }
            let has_remark = catalog
                .remarks
                .get(tier)
                .is_some_and(|by_locale| by_locale.contains_key(&default));
            if !has_remark {
                return Err(CatalogError::MissingDefaultRemark {
                    locale: default,
                    tier: tier.to_string(),
                });
            }
        }

        Ok(catalog)
    }
}

#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    default_locale: Locale,
    templates: HashMap<TemplateKey, Template>,
    remarks: HashMap<String, HashMap<Locale, String>>,
}

impl TemplateCatalog {
    pub fn builder(default_locale: Locale) -> CatalogBuilder {
        CatalogBuilder {
            default_locale,
            templates: HashMap::new(),
            remarks: HashMap::new(),
        }
    }

    pub fn default_locale(&self) -> Locale {
        self.default_locale
    }

    /// Locales with at least one template, sorted.
    pub fn locales(&self) -> Vec<Locale> {
        let mut locales: Vec<Locale> = self.templates.keys().map(|(locale, _)| *locale).collect();
        locales.sort();
        locales.dedup();
        locales
    }

    pub fn get(&self, locale: Locale, tier: &str) -> Result<&Template, CatalogError> {
        if let Some(template) = self.lookup_template(locale, tier) {
            return Ok(template);
        }
        debug!("no {locale} template for tier `{tier}`, using {}", self.default_locale);
        self.lookup_template(self.default_locale, tier)
            .ok_or_else(|| CatalogError::TemplateNotFound {
                locale,
                tier: tier.to_string(),
            })
    }

    pub fn get_special_remark(&self, tier: &str, locale: Locale) -> Result<&str, CatalogError> {
        let by_locale = self
            .remarks
            .get(tier)
            .ok_or_else(|| CatalogError::RemarkNotFound {
                locale,
                tier: tier.to_string(),
            })?;
        if let Some(text) = by_locale.get(&locale) {
            return Ok(text);
        }
        debug!("no {locale} remark for tier `{tier}`, using {}", self.default_locale);
        by_locale
            .get(&self.default_locale)
            .map(String::as_str)
            .ok_or_else(|| CatalogError::RemarkNotFound {
                locale,
                tier: tier.to_string(),
            })
    }

    fn lookup_template(&self, locale: Locale, tier: &str) -> Option<&Template> {
        self.templates
            .get(&(locale, Some(tier.to_string())))
            .or_else(|| self.templates.get(&(locale, None)))
    }
}
