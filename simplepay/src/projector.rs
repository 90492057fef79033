//! Order-sensitive projection of legacy field sets.
//!
//! Legacy messages are described by a schema: an ordered list of
//! [`FieldSpec`]s, each either a `single` field of the order or a `product`
//! field projected from every line item. A second, shorter list names the
//! fields that enter the hash chain. The projector turns frozen
//! [`LegacyFields`] into
//!
//! - the exact value sequence to sign ([`FieldProjector::project`]),
//! - the complete list of missing required fields ([`FieldProjector::missing_required`]),
//! - the ordered form fields to post ([`FieldProjector::form_data`]).
//!
//! Product values are emitted item by item, so reordering the items changes
//! the signature.

use crate::error::{GatewayError, Result};

/// Whether a field belongs to the order or to each product line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// One value for the whole order.
    Single,
    /// One value per product, taken from the named product attribute.
    Product(&'static str),
}

/// Schema entry of a legacy field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Wire name, e.g. `ORDER_REF`.
    pub name: &'static str,
    /// Single or product field.
    pub kind: FieldKind,
    /// Whether the gateway rejects a message without it.
    pub required: bool,
    /// Value set on construction when the caller gives none.
    pub default: Option<&'static str>,
}

impl FieldSpec {
    /// Optional single field.
    #[must_use]
    pub const fn single(name: &'static str) -> Self {
        Self { name, kind: FieldKind::Single, required: false, default: None }
    }

    /// Optional product field read from the `attribute` of each item.
    #[must_use]
    pub const fn product(name: &'static str, attribute: &'static str) -> Self {
        Self { name, kind: FieldKind::Product(attribute), required: false, default: None }
    }

    /// Marks the field as required.
    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Sets the construction default.
    #[must_use]
    pub const fn with_default(mut self, value: &'static str) -> Self {
        self.default = Some(value);
        self
    }
}

/// A value of a posted form: a scalar, or a list posted as `NAME[]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormValue {
    /// Scalar field.
    Single(String),
    /// Repeated field.
    List(Vec<String>),
}

impl FormValue {
    /// First value of the field.
    #[must_use]
    pub fn first(&self) -> Option<&str> {
        match self {
            Self::Single(value) => Some(value),
            Self::List(values) => values.first().map(String::as_str),
        }
    }
}

/// Ordered form field list.
pub type FormData = Vec<(String, FormValue)>;

/// Groups raw `name=value` pairs into a [`FormData`].
///
/// Names ending in `[]` are collected into one [`FormValue::List`]; a
/// repeated scalar name keeps its last value. First-appearance order is kept.
///
/// # Examples
///
/// ```
/// use simplepay::projector::{FormValue, collect_form};
///
/// let form = collect_form([("REFNOEXT", "101"), ("IPN_PID[]", "1"), ("IPN_PID[]", "2")]);
/// assert_eq!(form[1].1, FormValue::List(vec!["1".into(), "2".into()]));
/// ```
#[must_use]
pub fn collect_form<I, K, V>(pairs: I) -> FormData
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    let mut form: FormData = Vec::new();
    for (name, value) in pairs {
        let name = name.as_ref();
        let value = value.into();
        if let Some(list_name) = name.strip_suffix("[]") {
            match form.iter_mut().find(|(existing, _)| existing == list_name) {
                Some((_, FormValue::List(values))) => values.push(value),
                Some((_, slot)) => *slot = FormValue::List(vec![value]),
                None => form.push((list_name.to_owned(), FormValue::List(vec![value]))),
            }
        } else {
            match form.iter_mut().find(|(existing, _)| existing == name) {
                Some((_, slot)) => *slot = FormValue::Single(value),
                None => form.push((name.to_owned(), FormValue::Single(value))),
            }
        }
    }
    form
}

/// Looks up a field of a form by name.
#[must_use]
pub fn form_get<'a>(form: &'a FormData, name: &str) -> Option<&'a FormValue> {
    form.iter().find(|(existing, _)| existing == name).map(|(_, value)| value)
}

/// Flattens a form one level deep into its values, skipping the `skip` names.
///
/// List values are spliced in place, which is how posted legacy messages are
/// hashed.
#[must_use]
pub fn flat_values(form: &FormData, skip: &[&str]) -> Vec<String> {
    let mut values = Vec::new();
    for (name, value) in form {
        if skip.contains(&name.as_str()) {
            continue;
        }
        match value {
            FormValue::Single(value) => values.push(value.clone()),
            FormValue::List(list) => values.extend(list.iter().cloned()),
        }
    }
    values
}

/// Expands a form into wire pairs, lists becoming repeated `NAME[]` pairs.
#[must_use]
pub fn encode_pairs(form: &FormData) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (name, value) in form {
        match value {
            FormValue::Single(value) => pairs.push((name.clone(), value.clone())),
            FormValue::List(list) => {
                pairs.extend(list.iter().map(|value| (format!("{name}[]"), value.clone())));
            }
        }
    }
    pairs
}

/// One product line of a legacy order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Product {
    attributes: Vec<(String, String)>,
}

impl Product {
    /// Creates an empty product line.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a product attribute such as `name`, `code`, `info`, `price`, `qty` or `vat`.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with(mut self, attribute: impl Into<String>, value: impl Into<String>) -> Self {
        let attribute = attribute.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(name, _)| *name == attribute) {
            Some((_, slot)) => *slot = value,
            None => self.attributes.push((attribute, value)),
        }
        self
    }

    /// Value of an attribute.
    #[must_use]
    pub fn get(&self, attribute: &str) -> Option<&str> {
        self.attributes.iter().find(|(name, _)| name == attribute).map(|(_, value)| value.as_str())
    }
}

/// Field values and product lines of a legacy message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyFields {
    values: Vec<(String, String)>,
    products: Vec<Product>,
}

impl LegacyFields {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set holding every `single` default of `schema`.
    #[must_use]
    pub fn with_defaults(schema: &[FieldSpec]) -> Self {
        let mut fields = Self::new();
        for spec in schema {
            if let (FieldKind::Single, Some(default)) = (spec.kind, spec.default) {
                fields.set(spec.name, default);
            }
        }
        fields
    }

    /// Sets or replaces a single field.
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.values.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = value,
            None => self.values.push((name, value)),
        }
    }

    /// Value of a single field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.iter().find(|(existing, _)| existing == name).map(|(_, value)| value.as_str())
    }

    /// Appends a product line.
    pub fn push_product(&mut self, product: Product) {
        self.products.push(product);
    }

    /// Product lines in insertion order.
    #[must_use]
    pub fn products(&self) -> &[Product] {
        &self.products
    }
}

/// Projects [`LegacyFields`] through a schema.
#[derive(Debug, Clone, Copy)]
pub struct FieldProjector {
    schema: &'static [FieldSpec],
}

impl FieldProjector {
    /// Creates a projector over a static schema.
    #[must_use]
    pub const fn new(schema: &'static [FieldSpec]) -> Self {
        Self { schema }
    }

    /// Schema in use.
    #[must_use]
    pub const fn schema(&self) -> &'static [FieldSpec] {
        self.schema
    }

    fn spec(&self, name: &str) -> Result<&'static FieldSpec> {
        self.schema
            .iter()
            .find(|spec| spec.name == name)
            .ok_or_else(|| GatewayError::InvalidInput(format!("field {name} is not in the schema")))
    }

    /// Returns `true` when `name` belongs to the schema.
    #[must_use]
    pub fn knows(&self, name: &str) -> bool {
        self.schema.iter().any(|spec| spec.name == name)
    }

    /// Produces the value sequence to sign, following `hash_fields` order.
    ///
    /// Absent single values and absent product attributes are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidInput`] when a hash field is not in the schema.
    pub fn project(&self, hash_fields: &[&str], data: &LegacyFields) -> Result<Vec<String>> {
        let mut values = Vec::new();
        for name in hash_fields {
            match self.spec(name)?.kind {
                FieldKind::Single => {
                    if let Some(value) = data.get(name) {
                        values.push(value.to_owned());
                    }
                }
                FieldKind::Product(attribute) => {
                    values.extend(
                        data.products().iter().filter_map(|p| p.get(attribute)).map(str::to_owned),
                    );
                }
            }
        }
        Ok(values)
    }

    /// Lists every required field that is absent, in schema order.
    ///
    /// A product field counts as missing when any item lacks it. Each name
    /// appears at most once. The pass never stops at the first miss.
    #[must_use]
    pub fn missing_required(&self, data: &LegacyFields) -> Vec<String> {
        self.schema
            .iter()
            .filter(|spec| spec.required)
            .filter(|spec| match spec.kind {
                FieldKind::Single => data.get(spec.name).is_none(),
                FieldKind::Product(attribute) => {
                    data.products().iter().any(|product| product.get(attribute).is_none())
                }
            })
            .map(|spec| spec.name.to_owned())
            .collect()
    }

    /// Builds the ordered form fields: singles present in the data, then
    /// product fields as lists, all in schema order.
    #[must_use]
    pub fn form_data(&self, data: &LegacyFields) -> FormData {
        let mut form = Vec::new();
        for spec in self.schema {
            match spec.kind {
                FieldKind::Single => {
                    if let Some(value) = data.get(spec.name) {
                        form.push((spec.name.to_owned(), FormValue::Single(value.to_owned())));
                    }
                }
                FieldKind::Product(attribute) => {
                    let values: Vec<String> = data
                        .products()
                        .iter()
                        .filter_map(|product| product.get(attribute))
                        .map(str::to_owned)
                        .collect();
                    if !values.is_empty() {
                        form.push((spec.name.to_owned(), FormValue::List(values)));
                    }
                }
            }
        }
        form
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static SCHEMA: &[FieldSpec] = &[
        FieldSpec::single("A").required(),
        FieldSpec::single("B").required().with_default("b"),
        FieldSpec::single("C").required(),
        FieldSpec::product("P_NAME", "name"),
        FieldSpec::product("P_QTY", "qty").required(),
    ];

    #[test]
    fn test_missing_required_reports_all() {
        let projector = FieldProjector::new(SCHEMA);
        let data = LegacyFields::with_defaults(SCHEMA);
        assert_eq!(projector.missing_required(&data), ["A", "C"]);
    }

    #[test]
    fn test_missing_product_field_once() {
        let projector = FieldProjector::new(SCHEMA);
        let mut data = LegacyFields::with_defaults(SCHEMA);
        data.set("A", "a");
        data.set("C", "c");
        data.push_product(Product::new().with("name", "x"));
        data.push_product(Product::new().with("name", "y"));
        assert_eq!(projector.missing_required(&data), ["P_QTY"]);
    }

    #[test]
    fn test_project_follows_hash_order_and_items() {
        let projector = FieldProjector::new(SCHEMA);
        let mut data = LegacyFields::new();
        data.set("A", "a");
        data.set("C", "c");
        data.push_product(Product::new().with("name", "first").with("qty", "1"));
        data.push_product(Product::new().with("name", "second").with("qty", "2"));

        let values = projector.project(&["C", "P_NAME", "A", "P_QTY"], &data).unwrap();
        assert_eq!(values, ["c", "first", "second", "a", "1", "2"]);
    }

    #[test]
    fn test_project_unknown_field() {
        let projector = FieldProjector::new(SCHEMA);
        assert!(projector.project(&["NOPE"], &LegacyFields::new()).is_err());
    }

    #[test]
    fn test_form_data_in_schema_order() {
        let projector = FieldProjector::new(SCHEMA);
        let mut data = LegacyFields::new();
        data.set("C", "c");
        data.set("A", "a");
        data.push_product(Product::new().with("qty", "3"));

        let form = projector.form_data(&data);
        let names: Vec<_> = form.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["A", "C", "P_QTY"]);
        assert_eq!(form[2].1, FormValue::List(vec!["3".into()]));
    }

    #[test]
    fn test_collect_and_flatten_form() {
        let form = collect_form([
            ("REFNOEXT", "101"),
            ("IPN_PID[]", "1"),
            ("IPN_PNAME[]", "shoe"),
            ("IPN_PID[]", "2"),
            ("HASH", "h"),
        ]);
        assert_eq!(flat_values(&form, &["HASH"]), ["101", "1", "2", "shoe"]);
        assert_eq!(form_get(&form, "IPN_PNAME").and_then(FormValue::first), Some("shoe"));

        let pairs = encode_pairs(&form);
        assert_eq!(pairs[1], ("IPN_PID[]".to_owned(), "1".to_owned()));
        assert_eq!(pairs.len(), 5);
    }
}
