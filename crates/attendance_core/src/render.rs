use std::collections::BTreeMap;
use thiserror::Error;

use crate::catalog::Template;
use crate::schema::Representative;
use crate::tiers::AttendanceRatio;

/// Every placeholder a template may use.
pub const PLACEHOLDERS: &[&str] = &[
    "id",
    "name",
    "jurisdiction",
    "total_votes",
    "votes_cast",
    "attendance_pct",
    "special_message",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("template needs `{field}`, which this representative does not have")]
    MissingField { field: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

/// Binds a representative's record to a template.
#[derive(Debug, Clone)]
pub struct MessageRenderer {
    percent_decimals: usize,
}

impl Default for MessageRenderer {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MessageRenderer {
    pub fn new(percent_decimals: usize) -> Self {
        Self { percent_decimals }
    }

    pub fn percent_decimals(&self) -> usize {
        self.percent_decimals
    }

    pub fn format_percent(&self, ratio: AttendanceRatio) -> String {
        format!("{:.*}", self.percent_decimals, ratio.percent())
    }

    /// Values for every placeholder the record can satisfy. Absent fields are
    /// left unbound so that only templates which use them fail.
    pub fn bindings(
        &self,
        representative: &Representative,
        remark: &str,
    ) -> BTreeMap<&'static str, String> {
        let mut bindings = BTreeMap::new();
        if let Some(id) = &representative.id {
            bindings.insert("id", id.clone());
        }
        if let Some(name) = &representative.name {
            bindings.insert("name", name.clone());
        }
        if let Some(jurisdiction) = &representative.jurisdiction {
            bindings.insert("jurisdiction", jurisdiction.clone());
        }
        if let Some(total) = representative.votes_total_period {
            bindings.insert("total_votes", total.to_string());
        }
        if let Some(cast) = representative.votes_cast {
            bindings.insert("votes_cast", cast.to_string());
        }
        if let Some(ratio) = representative.attendance() {
            bindings.insert("attendance_pct", self.format_percent(ratio));
        }
        bindings.insert("special_message", remark.to_string());
        bindings
    }

    pub fn render(
        &self,
        representative: &Representative,
        template: &Template,
        remark: &str,
    ) -> Result<RenderedMessage, RenderError> {
        let bindings = self.bindings(representative, remark);
        Ok(RenderedMessage {
            subject: template.subject.render(&bindings)?,
            body: template.body.render(&bindings)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rep() -> Representative {
        Representative {
            id: Some("197".to_string()),
            name: Some("Malika Sorel".to_string()),
            jurisdiction: Some("France".to_string()),
            votes_total_period: Some(1215),
            votes_cast: Some(1213),
            email: None,
        }
    }

    fn template() -> Template {
        Template::parse(
            "Your attendance - {name}",
            "Dear {name},\n• Total: {total_votes}\n• Cast: {votes_cast}\n• Rate: {attendance_pct}%\n\n{special_message}",
        )
        .unwrap()
    }

    #[test]
    fn renders_counts_percentage_and_remark() {
        let out = MessageRenderer::default()
            .render(&rep(), &template(), "Well done!")
            .unwrap();
        assert_eq!(out.subject, "Your attendance - Malika Sorel");
        assert_eq!(
            out.body,
            "Dear Malika Sorel,\n• Total: 1215\n• Cast: 1213\n• Rate: 99.8%\n\nWell done!"
        );
    }

    #[test]
    fn percentage_precision_follows_configuration() {
        let ratio = AttendanceRatio::from_counts(1150, 1215).unwrap();
        assert_eq!(MessageRenderer::new(1).format_percent(ratio), "94.7");
        assert_eq!(MessageRenderer::new(2).format_percent(ratio), "94.65");
        assert_eq!(MessageRenderer::new(0).format_percent(ratio), "95");
        let full = AttendanceRatio::from_counts(10, 10).unwrap();
        assert_eq!(MessageRenderer::new(1).format_percent(full), "100.0");
    }

    #[test]
    fn rendering_is_deterministic() {
        let renderer = MessageRenderer::default();
        let first = renderer.render(&rep(), &template(), "remark").unwrap();
        for _ in 0..5 {
            assert_eq!(renderer.render(&rep(), &template(), "remark").unwrap(), first);
        }
    }

    #[test]
    fn missing_name_fails_only_when_the_template_needs_it() {
        let mut nameless = rep();
        nameless.name = None;
        let renderer = MessageRenderer::default();

        assert_eq!(
            renderer.render(&nameless, &template(), "remark"),
            Err(RenderError::MissingField {
                field: "name".to_string()
            })
        );

        let anonymous = Template::parse("Attendance {attendance_pct}%", "{special_message}").unwrap();
        let out = renderer.render(&nameless, &anonymous, "remark").unwrap();
        assert_eq!(out.subject, "Attendance 99.8%");
    }

    #[test]
    fn percentage_is_unbound_without_usable_counts() {
        let mut rep = rep();
        rep.votes_total_period = Some(0);
        rep.votes_cast = Some(0);
        let bindings = MessageRenderer::default().bindings(&rep, "");
        assert!(!bindings.contains_key("attendance_pct"));
        assert_eq!(bindings.get("total_votes").map(String::as_str), Some("0"));
    }
}
