use std::borrow::Cow;

use serde::{Deserialize, Deserializer};
use utoipa::openapi::{RefOr, Schema};
use utoipa::{PartialSchema, ToSchema};
use validator::Validate;

/// Request body that is rejected during deserialization when its `Validate` rules fail,
/// so `Json<ValidatedForm<T>>` answers 422 like any other malformed body.
#[derive(Debug)]
pub struct ValidatedForm<T>(pub T);

impl<'de, T> Deserialize<'de> for ValidatedForm<T>
where
    T: Deserialize<'de> + Validate,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = T::deserialize(deserializer)?;
        value.validate().map_err(serde::de::Error::custom)?;
        Ok(ValidatedForm(value))
    }
}

impl<T: ToSchema> PartialSchema for ValidatedForm<T> {
    fn schema() -> RefOr<Schema> {
        T::schema()
    }
}

impl<T: ToSchema> ToSchema for ValidatedForm<T> {
    fn name() -> Cow<'static, str> {
        T::name()
    }
}
