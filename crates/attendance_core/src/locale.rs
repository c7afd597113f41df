use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Display languages: the 24 official languages of the European Union.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    Bg,
    Cs,
    Da,
    De,
    El,
    En,
    Es,
    Et,
    Fi,
    Fr,
    Ga,
    Hr,
    Hu,
    It,
    Lt,
    Lv,
    Mt,
    Nl,
    Pl,
    Pt,
    Ro,
    Sk,
    Sl,
    Sv,
}

impl Locale {
    pub const ALL: [Locale; 24] = [
        Locale::Bg,
        Locale::Cs,
        Locale::Da,
        Locale::De,
        Locale::El,
        Locale::En,
        Locale::Es,
        Locale::Et,
        Locale::Fi,
        Locale::Fr,
        Locale::Ga,
        Locale::Hr,
        Locale::Hu,
        Locale::It,
        Locale::Lt,
        Locale::Lv,
        Locale::Mt,
        Locale::Nl,
        Locale::Pl,
        Locale::Pt,
        Locale::Ro,
        Locale::Sk,
        Locale::Sl,
        Locale::Sv,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Locale::Bg => "bg",
            Locale::Cs => "cs",
            Locale::Da => "da",
            Locale::De => "de",
            Locale::El => "el",
            Locale::En => "en",
            Locale::Es => "es",
            Locale::Et => "et",
            Locale::Fi => "fi",
            Locale::Fr => "fr",
            Locale::Ga => "ga",
            Locale::Hr => "hr",
            Locale::Hu => "hu",
            Locale::It => "it",
            Locale::Lt => "lt",
            Locale::Lv => "lv",
            Locale::Mt => "mt",
            Locale::Nl => "nl",
            Locale::Pl => "pl",
            Locale::Pt => "pt",
            Locale::Ro => "ro",
            Locale::Sk => "sk",
            Locale::Sl => "sl",
            Locale::Sv => "sv",
        }
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown locale code: {0:?}")]
pub struct UnknownLocale(pub String);

impl FromStr for Locale {
    type Err = UnknownLocale;

    /// Case-insensitive; region suffixes (`de-AT`, `pt_BR`) are ignored.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        let lang = normalized.split(['-', '_']).next().unwrap_or("");
        Locale::ALL
            .iter()
            .copied()
            .find(|locale| locale.as_str() == lang)
            .ok_or_else(|| UnknownLocale(value.to_string()))
    }
}

/// Maps a representative's jurisdiction to the language their message is
/// written in. Unmapped jurisdictions are expected and get the default.
#[derive(Debug, Clone)]
pub struct LocaleResolver {
    default: Locale,
    table: HashMap<String, Locale>,
}

impl LocaleResolver {
    pub fn new(default: Locale) -> Self {
        Self {
            default,
            table: HashMap::new(),
        }
    }

    pub fn with_table<I, S>(default: Locale, entries: I) -> Self
    where
        I: IntoIterator<Item = (S, Locale)>,
        S: AsRef<str>,
    {
        let mut resolver = Self::new(default);
        for (jurisdiction, locale) in entries {
            resolver.insert(jurisdiction.as_ref(), locale);
        }
        resolver
    }

    pub fn insert(&mut self, jurisdiction: &str, locale: Locale) {
        self.table.insert(normalize(jurisdiction), locale);
    }

    pub fn default_locale(&self) -> Locale {
        self.default
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn resolve(&self, jurisdiction: &str) -> Locale {
        match self.table.get(&normalize(jurisdiction)) {
            Some(locale) => *locale,
            None => {
                debug!(
                    "no locale mapped for jurisdiction {jurisdiction:?}, using {}",
                    self.default
                );
                self.default
            }
        }
    }
}

fn normalize(jurisdiction: &str) -> String {
    jurisdiction.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> LocaleResolver {
        LocaleResolver::with_table(
            Locale::En,
            [
                ("Austria", Locale::De),
                ("Kingdom of the Netherlands", Locale::Nl),
                ("Luxembourg", Locale::Fr),
            ],
        )
    }

    #[test]
    fn mapped_jurisdictions_resolve_to_their_language() {
        let r = resolver();
        assert_eq!(r.resolve("Austria"), Locale::De);
        assert_eq!(r.resolve("Luxembourg"), Locale::Fr);
        assert_eq!(r.resolve("Kingdom of the Netherlands"), Locale::Nl);
    }

    #[test]
    fn lookup_ignores_case_and_surrounding_whitespace() {
        let r = resolver();
        assert_eq!(r.resolve("  austria "), Locale::De);
        assert_eq!(r.resolve("KINGDOM OF THE NETHERLANDS"), Locale::Nl);
    }

    #[test]
    fn unmapped_jurisdiction_falls_back_to_default() {
        let r = resolver();
        assert_eq!(r.resolve("Atlantis"), Locale::En);
        assert_eq!(r.resolve(""), Locale::En);

        let german_default = LocaleResolver::new(Locale::De);
        assert_eq!(german_default.resolve("Atlantis"), Locale::De);
    }

    #[test]
    fn locale_codes_parse_case_insensitively() {
        assert_eq!("de".parse::<Locale>(), Ok(Locale::De));
        assert_eq!("EN".parse::<Locale>(), Ok(Locale::En));
        assert_eq!("pt_BR".parse::<Locale>(), Ok(Locale::Pt));
        assert_eq!(" sv-FI ".parse::<Locale>(), Ok(Locale::Sv));
        assert!("xx".parse::<Locale>().is_err());
        assert!("".parse::<Locale>().is_err());
    }

    #[test]
    fn every_locale_round_trips_through_its_code() {
        for locale in Locale::ALL {
            assert_eq!(locale.as_str().parse::<Locale>(), Ok(locale));
            assert_eq!(locale.to_string(), locale.as_str());
        }
    }
}
