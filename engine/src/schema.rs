//! Boundary normalization and validation of entity fields.
//!
//! Rows and mutation payloads enter the engine with inconsistent spellings
//! (`cash_amount` next to `cashAmount`, numeric columns delivered as
//! strings). Everything is normalized here, once, so the cache, queue and
//! reconciler only ever see camelCase keys with the declared value types.

use crate::{
    entity::{EntityType, Fields},
    error::Result,
    operation::{Change, LinkedUpdate, Mutation, OperationKind},
    Error,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// Milliseconds since epoch
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl FieldType {
    fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Int | FieldType::Float)
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field of an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Normalized (camelCase) field name
    pub name: String,
    pub field_type: FieldType,
    /// Required on create; never nullable
    pub required: bool,
}

impl FieldDef {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a value. `None` means the field is absent.
    pub fn validate(&self, value: Option<&Value>, partial: bool) -> Result<()> {
        match value {
            None if self.required && !partial => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            None => Ok(()),
            Some(Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }

    /// Coerce loosely typed input (numeric strings) to the declared type.
    fn coerce(&self, value: Value) -> Value {
        match (&self.field_type, value) {
            (FieldType::Int | FieldType::Float | FieldType::Timestamp, Value::String(s)) => {
                match s.trim().parse::<f64>() {
                    Ok(n) if n.is_finite() => crate::operation::number_value(n),
                    _ => Value::String(s),
                }
            }
            (FieldType::Bool, Value::String(s)) => match s.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => Value::String(s),
            },
            (_, value) => value,
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// Convert a `snake_case` key to `camelCase`. Keys already in camelCase
/// are returned unchanged.
pub fn camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for c in key.chars() {
        if c == '_' {
            upper = !out.is_empty();
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Normalize every key of an object, recursing into nested objects.
///
/// When two spellings of the same field are present the camelCase one wins.
pub fn normalize_keys(fields: Fields) -> Fields {
    let mut out = Fields::new();
    let mut aliased = Vec::new();
    for (key, value) in fields {
        let value = normalize_value(value);
        let normalized = camel_case(&key);
        if normalized == key {
            out.insert(key, value);
        } else {
            aliased.push((normalized, value));
        }
    }
    for (key, value) in aliased {
        out.entry(key).or_insert(value);
    }
    out
}

fn normalize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(normalize_keys(map)),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_value).collect()),
        other => other,
    }
}

/// Schema for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySchema {
    pub entity_type: EntityType,
    pub fields: Vec<FieldDef>,
}

impl EntitySchema {
    pub fn new(entity_type: EntityType, fields: Vec<FieldDef>) -> Self {
        Self {
            entity_type,
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validate a complete record. Undeclared fields are allowed.
    pub fn validate_record(&self, fields: &Fields) -> Result<()> {
        for def in &self.fields {
            def.validate(fields.get(&def.name), false)?;
        }
        Ok(())
    }

    /// Validate a partial record: only the fields present are checked.
    pub fn validate_patch(&self, fields: &Fields) -> Result<()> {
        for (name, value) in fields {
            if let Some(def) = self.field(name) {
                def.validate(Some(value), true)?;
            }
        }
        Ok(())
    }

    /// Validate a change: the patch plus the numeric targets of adjustments.
    pub fn validate_change(&self, change: &Change) -> Result<()> {
        self.validate_patch(&change.fields)?;
        for adj in &change.adjustments {
            if !adj.delta.is_finite() {
                return Err(Error::InvalidPayload(format!(
                    "adjustment of '{}' is not a finite number",
                    adj.field
                )));
            }
            if let Some(def) = self.field(&adj.field) {
                if !def.field_type.is_numeric() {
                    return Err(Error::TypeMismatch {
                        field: adj.field.clone(),
                        expected: def.field_type.to_string(),
                        got: "adjustment".into(),
                    });
                }
            }
        }
        Ok(())
    }

    fn coerce(&self, mut fields: Fields) -> Fields {
        for def in &self.fields {
            if let Some(value) = fields.remove(&def.name) {
                fields.insert(def.name.clone(), def.coerce(value));
            }
        }
        fields
    }
}

/// Schemas of every entity type the engine caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub entities: HashMap<EntityType, EntitySchema>,
}

impl Default for Schema {
    fn default() -> Self {
        Self::shop()
    }
}

impl Schema {
    /// An empty schema: keys are still normalized, nothing is validated.
    pub fn empty() -> Self {
        Self {
            entities: HashMap::new(),
        }
    }

    /// The shop dashboard's record layouts.
    pub fn shop() -> Self {
        use FieldType::*;

        Self::empty()
            .with_entity(EntitySchema::new(
                EntityType::Product,
                vec![
                    FieldDef::required("name", String),
                    FieldDef::optional("currentStock", Float),
                    FieldDef::optional("costPrice", Float),
                    FieldDef::optional("sellingPrice", Float),
                    FieldDef::optional("category", String),
                    FieldDef::optional("updatedAt", Timestamp),
                ],
            ))
            .with_entity(EntitySchema::new(
                EntityType::Customer,
                vec![
                    FieldDef::required("name", String),
                    FieldDef::optional("phone", String),
                    FieldDef::optional("outstandingDebt", Float),
                    FieldDef::optional("updatedAt", Timestamp),
                ],
            ))
            .with_entity(EntitySchema::new(
                EntityType::Sale,
                vec![
                    FieldDef::required("total", Float),
                    FieldDef::optional("paymentMethod", String),
                    FieldDef::optional("paymentDetails", Json),
                    FieldDef::optional("customerId", String),
                    FieldDef::optional("items", Json),
                    FieldDef::optional("updatedAt", Timestamp),
                ],
            ))
            .with_entity(EntitySchema::new(
                EntityType::Transaction,
                vec![
                    FieldDef::required("amount", Float),
                    FieldDef::optional("type", String),
                    FieldDef::optional("description", String),
                    FieldDef::optional("updatedAt", Timestamp),
                ],
            ))
            .with_entity(EntitySchema::new(
                EntityType::DebtPayment,
                vec![
                    FieldDef::required("customerId", String),
                    FieldDef::required("amount", Float),
                    FieldDef::optional("paymentMethod", String),
                    FieldDef::optional("updatedAt", Timestamp),
                ],
            ))
    }

    pub fn with_entity(mut self, schema: EntitySchema) -> Self {
        self.entities.insert(schema.entity_type, schema);
        self
    }

    pub fn get(&self, entity_type: EntityType) -> Option<&EntitySchema> {
        self.entities.get(&entity_type)
    }

    /// Normalize keys and coerce declared types of a row or patch.
    pub fn normalize(&self, entity_type: EntityType, fields: Fields) -> Fields {
        let fields = normalize_keys(fields);
        match self.get(entity_type) {
            Some(schema) => schema.coerce(fields),
            None => fields,
        }
    }

    /// Normalize a remote row and check the types of the fields it carries.
    pub fn normalize_row(&self, entity_type: EntityType, row: Fields) -> Result<Fields> {
        let row = self.normalize(entity_type, row);
        if let Some(schema) = self.get(entity_type) {
            schema.validate_patch(&row)?;
        }
        Ok(row)
    }

    fn normalize_change(&self, entity_type: EntityType, change: Change) -> Change {
        let mut fields = self.normalize(entity_type, change.fields);
        fields.remove("id");
        change
            .adjustments
            .into_iter()
            .fold(Change::set(fields), |acc, adj| {
                acc.with_adjustment(camel_case(&adj.field), adj.delta)
            })
    }

    /// Normalize a mutation intent and validate it against the entity
    /// schemas. Creates must carry every required field.
    pub fn prepare(&self, mut mutation: Mutation) -> Result<Mutation> {
        mutation.change = self.normalize_change(mutation.entity_type, mutation.change);
        if let Some(linked) = mutation.linked_update.take() {
            if linked.entity_type == mutation.entity_type
                && mutation.entity_id.as_deref() == Some(linked.entity_id.as_str())
            {
                return Err(Error::InvalidOperation(
                    "linked update must target a different entity".into(),
                ));
            }
            mutation.linked_update = Some(LinkedUpdate {
                change: self.normalize_change(linked.entity_type, linked.change),
                ..linked
            });
        }

        if let Some(schema) = self.get(mutation.entity_type) {
            match mutation.kind {
                OperationKind::Create => {
                    schema.validate_change(&mutation.change)?;
                    schema.validate_record(&mutation.change.folded()?)?;
                }
                OperationKind::Update => schema.validate_change(&mutation.change)?,
                OperationKind::Delete => {}
            }
        }
        if let Some(linked) = &mutation.linked_update {
            if let Some(schema) = self.get(linked.entity_type) {
                schema.validate_change(&linked.change)?;
            }
        }
        Ok(mutation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn camel_case_conversion() {
        assert_eq!(camel_case("cash_amount"), "cashAmount");
        assert_eq!(camel_case("cashAmount"), "cashAmount");
        assert_eq!(camel_case("outstanding_debt"), "outstandingDebt");
        assert_eq!(camel_case("_private"), "private");
        assert_eq!(camel_case("id"), "id");
    }

    #[test]
    fn nested_payment_details_are_normalized() {
        let row = fields(json!({
            "payment_method": "mixed",
            "payment_details": {"cash_amount": 200, "mobile_amount": 300}
        }));
        let normalized = normalize_keys(row);

        assert_eq!(
            Value::Object(normalized),
            json!({
                "paymentMethod": "mixed",
                "paymentDetails": {"cashAmount": 200, "mobileAmount": 300}
            })
        );
    }

    #[test]
    fn camel_spelling_wins_over_alias() {
        let row = fields(json!({"cash_amount": 1, "cashAmount": 2}));
        assert_eq!(normalize_keys(row)["cashAmount"], json!(2));
    }

    #[test]
    fn numeric_strings_are_coerced() {
        let schema = Schema::shop();
        let row = schema
            .normalize_row(
                EntityType::Product,
                fields(json!({"id": "p-1", "name": "Soap", "cost_price": "12.50", "current_stock": "10"})),
            )
            .unwrap();

        assert_eq!(row["costPrice"], json!(12.5));
        assert_eq!(row["currentStock"], json!(10));
    }

    #[test]
    fn remote_row_with_wrong_type_is_rejected() {
        let schema = Schema::shop();
        let result = schema.normalize_row(
            EntityType::Customer,
            fields(json!({"id": "c-1", "outstanding_debt": "plenty"})),
        );
        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "outstandingDebt"));
    }

    #[test]
    fn create_requires_required_fields() {
        let schema = Schema::shop();
        let missing = Mutation::create(EntityType::Customer, fields(json!({"phone": "0700"})));
        assert!(matches!(
            schema.prepare(missing),
            Err(Error::MissingRequiredField(f)) if f == "name"
        ));

        let ok = Mutation::create(EntityType::Customer, fields(json!({"name": "Amina"})));
        assert!(schema.prepare(ok).is_ok());
    }

    #[test]
    fn update_validates_only_present_fields() {
        let schema = Schema::shop();
        let patch = Mutation::update(
            EntityType::Product,
            "p-1",
            Change::set(fields(json!({"current_stock": 9}))),
        );
        let prepared = schema.prepare(patch).unwrap();
        assert_eq!(prepared.change.fields["currentStock"], json!(9));

        let null_name = Mutation::update(
            EntityType::Product,
            "p-1",
            Change::set(fields(json!({"name": null}))),
        );
        assert!(schema.prepare(null_name).is_err());
    }

    #[test]
    fn adjustment_must_target_numeric_field() {
        let schema = Schema::shop();
        let bad = Mutation::update(EntityType::Customer, "c-1", Change::adjust("name", 1.0));
        assert!(matches!(schema.prepare(bad), Err(Error::TypeMismatch { .. })));

        let snake = Mutation::update(
            EntityType::Customer,
            "c-1",
            Change::adjust("outstanding_debt", -200.0),
        );
        let prepared = schema.prepare(snake).unwrap();
        assert_eq!(prepared.change.adjustments[0].field, "outstandingDebt");
    }

    #[test]
    fn linked_update_is_normalized_and_validated() {
        let schema = Schema::shop();
        let sale = Mutation::create(EntityType::Sale, fields(json!({"total": 500})))
            .with_linked(LinkedUpdate::new(
                EntityType::Customer,
                "c-1",
                Change::adjust("outstanding_debt", 500.0),
            ));
        let prepared = schema.prepare(sale).unwrap();
        assert_eq!(
            prepared.linked_update.unwrap().change.adjustments[0].field,
            "outstandingDebt"
        );

        let bad = Mutation::create(EntityType::Sale, fields(json!({"total": 500})))
            .with_linked(LinkedUpdate::new(
                EntityType::Customer,
                "c-1",
                Change::set(fields(json!({"outstandingDebt": "x"}))),
            ));
        assert!(schema.prepare(bad).is_err());
    }

    #[test]
    fn mutation_payload_cannot_set_id() {
        let schema = Schema::shop();
        let patch = Mutation::update(
            EntityType::Product,
            "p-1",
            Change::set(fields(json!({"id": "p-2", "name": "Soap"}))),
        );
        assert!(!schema.prepare(patch).unwrap().change.fields.contains_key("id"));
    }

    #[test]
    fn empty_schema_only_normalizes() {
        let schema = Schema::empty();
        let prepared = schema
            .prepare(Mutation::create(EntityType::Customer, fields(json!({"full_name": 3}))))
            .unwrap();
        assert_eq!(prepared.change.fields["fullName"], json!(3));
    }

    #[test]
    fn field_type_display() {
        assert_eq!(FieldType::String.to_string(), "String");
        assert_eq!(FieldType::Float.to_string(), "Float");
        assert_eq!(FieldType::Json.to_string(), "Json");
    }

    #[test]
    fn schema_serialization() {
        let schema = Schema::shop();
        let json = serde_json::to_string(&schema).unwrap();
        let parsed: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(schema, parsed);
    }
}
