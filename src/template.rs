//! Renders HTML/text email bodies from a runtime template directory.
//! See spec.md §4.4 and §6.4 for the fallback-text catalogue.

use crate::error::ServiceError;
use crate::queue::EmailType;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tera::{Tera, Value as TeraValue};
use tracing::{info, warn};

fn format_date(value: &TeraValue, _args: &std::collections::HashMap<String, TeraValue>) -> tera::Result<TeraValue> {
    Ok(value.clone())
}

fn format_time(value: &TeraValue, _args: &std::collections::HashMap<String, TeraValue>) -> tera::Result<TeraValue> {
    Ok(value.clone())
}

pub struct TemplateRenderer {
    tera: Tera,
    dir: PathBuf,
}

impl TemplateRenderer {
    /// Creates the template directory if it doesn't exist yet, then
    /// glob-loads every `*.html`/`*.txt` file beneath it. Tera autoescapes
    /// `.html`-suffixed templates by default (spec.md "MUST autoescape").
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|err| ServiceError::Config(format!("could not create template dir: {err}")))?;

        let glob = format!("{}/**/*", dir.display());
        let mut tera = Tera::new(&glob)
            .map_err(|err| ServiceError::template(err.to_string(), None))?;
        tera.register_filter("format_date", format_date);
        tera.register_filter("format_time", format_time);

        info!(dir = %dir.display(), templates = tera.get_template_names().count(), "template renderer ready");
        Ok(Self { tera, dir })
    }

    fn html_name(email_type: EmailType) -> String {
        format!("{}.html", email_type.as_str())
    }

    fn text_name(email_type: EmailType) -> String {
        format!("{}.txt", email_type.as_str())
    }

    pub fn template_exists(&self, email_type: EmailType, kind: &str) -> bool {
        let name = match kind {
            "html" => Self::html_name(email_type),
            "text" => Self::text_name(email_type),
            _ => return false,
        };
        self.tera.get_template_names().any(|n| n == name)
    }

    /// Renders the HTML body. A missing template is always an error —
    /// unlike the text variant, there is no generated fallback for HTML.
    pub fn render_html(&self, email_type: EmailType, context: &Value) -> Result<String, ServiceError> {
        let name = Self::html_name(email_type);
        let ctx = tera::Context::from_serialize(context)
            .map_err(|err| ServiceError::template(err.to_string(), Some(name.clone())))?;

        self.tera
            .render(&name, &ctx)
            .map_err(|err| ServiceError::template(err.to_string(), Some(name)))
    }

    /// Renders the plaintext body, falling back to a generated,
    /// language-localised courtesy paragraph (spec.md §6.4) when no
    /// `.txt` template exists for this type.
    pub fn render_text(&self, email_type: EmailType, context: &Value) -> Result<String, ServiceError> {
        let name = Self::text_name(email_type);
        if self.template_exists(email_type, "text") {
            let ctx = tera::Context::from_serialize(context)
                .map_err(|err| ServiceError::template(err.to_string(), Some(name.clone())))?;
            return self
                .tera
                .render(&name, &ctx)
                .map_err(|err| ServiceError::template(err.to_string(), Some(name)));
        }

        Ok(fallback_text(email_type, context))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Re-scans the template directory. Used by tests that drop new
    /// template files in after construction.
    pub fn reload(&mut self) -> Result<(), ServiceError> {
        self.tera
            .full_reload()
            .map_err(|err| ServiceError::template(err.to_string(), None))
    }
}

fn string_field<'a>(context: &'a Value, key: &str, default: &'a str) -> &'a str {
    context.get(key).and_then(Value::as_str).unwrap_or(default)
}

/// Spanish fallback catalogue, ported field-for-field from the original
/// renderer's `_generate_fallback_text` (see DESIGN.md).
fn fallback_text(email_type: EmailType, context: &Value) -> String {
    let customer_name = string_field(context, "customer_name", "Cliente");
    let service_type = string_field(context, "service_type", "N/A");
    let booking_date = string_field(context, "booking_date", "N/A");
    let booking_time = string_field(context, "booking_time", "N/A");

    match email_type {
        EmailType::BookingCreated => {
            let duration_minutes = string_field(context, "duration_minutes", "N/A");
            format!(
                "Hola {customer_name},\n\nTu cita ha sido confirmada:\n\nServicio: {service_type}\nFecha: {booking_date}\nHora: {booking_time}\nDuracion: {duration_minutes} minutos\n\nGracias por tu confianza."
            )
        }
        EmailType::BookingCancelled => format!(
            "Hola {customer_name},\n\nTu cita ha sido cancelada:\n\nServicio: {service_type}\nFecha: {booking_date}\nHora: {booking_time}\n\nGracias por tu confianza."
        ),
        EmailType::BookingRescheduled => {
            let old_date = string_field(context, "old_date", "N/A");
            let old_time = string_field(context, "old_time", "N/A");
            let new_date = string_field(context, "new_date", "N/A");
            let new_time = string_field(context, "new_time", "N/A");
            format!(
                "Hola {customer_name},\n\nTu cita ha sido reagendada:\n\nServicio: {service_type}\nFecha anterior: {old_date} - {old_time}\nNueva fecha: {new_date} - {new_time}\n\nGracias por tu confianza."
            )
        }
        EmailType::Reminder24h | EmailType::Reminder1h => {
            let default_hours = if email_type == EmailType::Reminder24h { "24" } else { "1" };
            let hours_until = string_field(context, "hours_until", default_hours);
            format!(
                "Hola {customer_name},\n\nRecordatorio: Tienes una cita en {hours_until} horas.\n\nServicio: {service_type}\nFecha: {booking_date}\nHora: {booking_time}\n\nTe esperamos!"
            )
        }
        EmailType::ReminderCustom | EmailType::OtpVerification | EmailType::Transactional => {
            format!("Hola {customer_name},\n\nGracias por tu confianza.")
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("remit-template-test-{name}"))
    }

    #[test]
    fn missing_html_template_is_a_template_error() {
        let dir = scratch_dir("missing-html");
        let _ = std::fs::remove_dir_all(&dir);
        let renderer = TemplateRenderer::new(&dir).unwrap();

        let err = renderer
            .render_html(EmailType::Transactional, &json!({}))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Template { .. }));
    }

    #[test]
    fn render_text_falls_back_when_no_txt_template_exists() {
        let dir = scratch_dir("fallback-text");
        let _ = std::fs::remove_dir_all(&dir);
        let renderer = TemplateRenderer::new(&dir).unwrap();

        let rendered = renderer
            .render_text(
                EmailType::BookingCreated,
                &json!({ "customer_name": "Ana", "service_type": "Corte", "booking_date": "lunes" }),
            )
            .unwrap();
        assert!(rendered.contains("Ana"));
        assert!(rendered.contains("Corte"));
    }

    #[test]
    fn render_html_autoescapes_context_values() {
        let dir = scratch_dir("autoescape");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("transactional.html"), "<p>Hello {{ name }}</p>").unwrap();

        let renderer = TemplateRenderer::new(&dir).unwrap();
        let rendered = renderer
            .render_html(EmailType::Transactional, &json!({ "name": "<script>" }))
            .unwrap();
        assert!(!rendered.contains("<script>"));
        assert!(rendered.contains("&lt;script&gt;"));
    }
}
