//! Resendable multipart form payloads.
//!
//! `reqwest::multipart::Form` is consumed by a send, so the retry loop cannot
//! hold one across attempts. [`FormPayload`] keeps the fields in plain data
//! form and materializes a fresh `Form` for every attempt, guaranteeing the
//! identical body is re-sent. Whether that resend is safe side-effect-wise is
//! the caller's contract.

use kontext_types::Artifact;
use reqwest::multipart::{Form, Part};

#[derive(Clone, Debug)]
enum FormValue {
    Text(String),
    File {
        data: Artifact,
        file_name: String,
        mime: Option<String>,
    },
}

/// Ordered multipart field list, safe to materialize any number of times.
#[derive(Clone, Debug, Default)]
pub struct FormPayload {
    fields: Vec<(String, FormValue)>,
}

impl FormPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a text field. Numbers are passed through `ToString`.
    pub fn text(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.fields
            .push((name.into(), FormValue::Text(value.to_string())));
        self
    }

    /// Append a file part carrying an opaque artifact.
    pub fn file(
        mut self,
        name: impl Into<String>,
        data: Artifact,
        file_name: impl Into<String>,
    ) -> Self {
        self.fields.push((
            name.into(),
            FormValue::File {
                data,
                file_name: file_name.into(),
                mime: None,
            },
        ));
        self
    }

    /// Append a file part with an explicit media type.
    pub fn file_with_mime(
        mut self,
        name: impl Into<String>,
        data: Artifact,
        file_name: impl Into<String>,
        mime: impl Into<String>,
    ) -> Self {
        self.fields.push((
            name.into(),
            FormValue::File {
                data,
                file_name: file_name.into(),
                mime: Some(mime.into()),
            },
        ));
        self
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Build a fresh single-use `reqwest` form from the stored fields.
    pub(crate) fn to_form(&self) -> Form {
        let mut form = Form::new();
        for (name, value) in &self.fields {
            form = match value {
                FormValue::Text(text) => form.text(name.clone(), text.clone()),
                FormValue::File {
                    data,
                    file_name,
                    mime,
                } => {
                    let part = Part::bytes(data.to_vec()).file_name(file_name.clone());
                    let part = match mime {
                        // Unparseable mime falls back to the untyped part.
                        Some(mime) => part.mime_str(mime).unwrap_or_else(|_| {
                            Part::bytes(data.to_vec()).file_name(file_name.clone())
                        }),
                        None => part,
                    };
                    form.part(name.clone(), part)
                }
            };
        }
        form
    }
}
