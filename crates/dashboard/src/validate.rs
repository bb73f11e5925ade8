use common::api::FieldErrors;

use crate::store::Entity;

pub const INVALID_VALUE: &str = "Invalid value";

/// A validator inspects a candidate against the current collection and adds
/// any complaint to `errors`, keyed by field.
pub type Validator<T> = fn(&T, &[T], &mut FieldErrors);

/// `name` must not be used by another entity of the same kind.
pub fn name_unique<T: Entity>(candidate: &T, existing: &[T], errors: &mut FieldErrors) {
    let taken = existing
        .iter()
        .filter(|e| e.id() != candidate.id())
        .any(|e| e.name() == candidate.name());

    if taken {
        errors.insert("name".to_string(), INVALID_VALUE.to_string());
    }
}

/// `port` must be within 1..=65535.
pub fn port_in_range<T: Entity>(candidate: &T, _existing: &[T], errors: &mut FieldErrors) {
    if let Some(0) = candidate.port() {
        errors.insert("port".to_string(), INVALID_VALUE.to_string());
    }
}

/// Run every validator and collect the field errors. Empty means valid.
pub fn run<T>(candidate: &T, existing: &[T], validators: &[Validator<T>]) -> FieldErrors {
    let mut errors = FieldErrors::new();
    for validate in validators {
        validate(candidate, existing, &mut errors);
    }
    errors
}
