//! XEP-0004 data forms, as used by node and subscription configuration.
//!
//! Only the parts pubsub needs: fields with a `var`, an optional type and a
//! list of values. Labels and options are emitted on result forms but never
//! parsed back.

use minidom::Element;

use crate::error::PubSubError;

/// Data forms namespace.
pub const NS_DATA_FORMS: &str = "jabber:x:data";

/// A single form field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    /// Field variable name (e.g. `pubsub#title`).
    pub var: String,
    /// Field type (`boolean`, `list-single`, `jid-multi`, ...).
    pub field_type: Option<String>,
    /// Human-readable label, only emitted.
    pub label: Option<String>,
    /// Field values in document order.
    pub values: Vec<String>,
}

impl FormField {
    /// Create a field with a single value.
    pub fn new(var: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            var: var.into(),
            field_type: None,
            label: None,
            values: vec![value.into()],
        }
    }

    /// Create a field with several values.
    pub fn multi(var: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            var: var.into(),
            field_type: None,
            label: None,
            values,
        }
    }

    /// Set the field type.
    pub fn with_type(mut self, field_type: &str) -> Self {
        self.field_type = Some(field_type.to_string());
        self
    }

    /// Set the field label.
    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    /// First value, if any.
    pub fn first_value(&self) -> Option<&str> {
        self.values.first().map(String::as_str)
    }

    /// Parse the first value as an XEP-0004 boolean (`1`/`true`/`0`/`false`).
    pub fn bool_value(&self) -> Result<bool, PubSubError> {
        match self.first_value().map(str::trim) {
            Some("1") | Some("true") => Ok(true),
            Some("0") | Some("false") => Ok(false),
            other => Err(PubSubError::not_acceptable(format!(
                "{}: invalid boolean {:?}",
                self.var, other
            ))),
        }
    }

    /// Parse the first value as a signed integer.
    pub fn int_value(&self) -> Result<i64, PubSubError> {
        self.first_value()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| {
                PubSubError::not_acceptable(format!("{}: expected an integer", self.var))
            })
    }

    /// Parse a field element.
    pub fn from_element(elem: &Element) -> Option<Self> {
        let var = elem.attr("var")?.to_string();
        let values = elem
            .children()
            .filter(|c| c.is("value", NS_DATA_FORMS))
            .map(|c| c.text().trim().to_string())
            .collect();

        Some(Self {
            var,
            field_type: elem.attr("type").map(String::from),
            label: elem.attr("label").map(String::from),
            values,
        })
    }

    /// Build the field element.
    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("field", NS_DATA_FORMS).attr("var", &self.var);

        if let Some(ref field_type) = self.field_type {
            builder = builder.attr("type", field_type);
        }
        if let Some(ref label) = self.label {
            builder = builder.attr("label", label);
        }

        for value in &self.values {
            builder = builder.append(
                Element::builder("value", NS_DATA_FORMS)
                    .append(value.as_str())
                    .build(),
            );
        }

        builder.build()
    }
}

/// A data form with its `FORM_TYPE` split out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataForm {
    /// Value of the hidden `FORM_TYPE` field.
    pub form_type: Option<String>,
    /// All other fields.
    pub fields: Vec<FormField>,
}

impl DataForm {
    /// Create an empty form of the given `FORM_TYPE`.
    pub fn new(form_type: &str) -> Self {
        Self {
            form_type: Some(form_type.to_string()),
            fields: Vec::new(),
        }
    }

    /// Append a field.
    pub fn push(&mut self, field: FormField) {
        self.fields.push(field);
    }

    /// Builder-style append.
    pub fn with_field(mut self, field: FormField) -> Self {
        self.fields.push(field);
        self
    }

    /// Look up a field by variable name.
    pub fn field(&self, var: &str) -> Option<&FormField> {
        self.fields.iter().find(|f| f.var == var)
    }

    /// Parse an `<x xmlns='jabber:x:data'/>` element.
    ///
    /// Forms of type `cancel` carry no data and parse to `None`.
    pub fn from_element(elem: &Element) -> Option<Self> {
        if !elem.is("x", NS_DATA_FORMS) || elem.attr("type") == Some("cancel") {
            return None;
        }

        let mut form = DataForm::default();
        for field in elem
            .children()
            .filter(|c| c.is("field", NS_DATA_FORMS))
            .filter_map(FormField::from_element)
        {
            if field.var == "FORM_TYPE" {
                form.form_type = field.first_value().map(String::from);
            } else {
                form.fields.push(field);
            }
        }

        Some(form)
    }

    /// Find and parse the first data form child of `parent`.
    pub fn find_in(parent: &Element) -> Option<Self> {
        parent
            .get_child("x", NS_DATA_FORMS)
            .and_then(DataForm::from_element)
    }

    /// Build the form element with the given form type attribute
    /// (`form`, `submit` or `result`).
    pub fn to_element(&self, kind: &str) -> Element {
        let mut builder = Element::builder("x", NS_DATA_FORMS).attr("type", kind);

        if let Some(ref form_type) = self.form_type {
            builder = builder.append(
                FormField::new("FORM_TYPE", form_type.as_str())
                    .with_type("hidden")
                    .to_element(),
            );
        }

        for field in &self.fields {
            builder = builder.append(field.to_element());
        }

        builder.build()
    }
}
