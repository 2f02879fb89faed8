use crate::error::OnceError;

/// Whether a field can change after construction.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Field {
    Immutable,
    Mutable,
}

/// Whether the wrapper routes a method through the interceptor.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Routing {
    Intercepted,
    /// The method bypasses the wrapper. Always a configuration error: the
    /// engine fails fast rather than memoize inconsistently.
    Direct,
}

/// A settable property's interception surface.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Property {
    pub settable: bool,
    pub intercepted_getter: bool,
}

/// A declarative description of a wrapped type's member surface.
///
/// The wrapper author enumerates the type's fields, methods, and properties;
/// [`verify`](Contract::verify) then checks that the surface is safe to
/// memoize. This replaces runtime type introspection: what the contract does
/// not declare, the engine cannot see, so the declaration is the source of
/// truth.
pub struct Contract {
    type_name: &'static str,
    fields: Vec<(&'static str, Field)>,
    methods: Vec<(&'static str, Routing)>,
    properties: Vec<(&'static str, Property)>,
}

impl Contract {
    pub fn new(type_name: &'static str) -> Self {
        Self {
            type_name,
            fields: Vec::new(),
            methods: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub fn field(mut self, name: &'static str, field: Field) -> Self {
        self.fields.push((name, field));
        self
    }

    pub fn method(mut self, name: &'static str, routing: Routing) -> Self {
        self.methods.push((name, routing));
        self
    }

    pub fn property(mut self, name: &'static str, property: Property) -> Self {
        self.properties.push((name, property));
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Checks that the declared surface is safe to memoize.
    ///
    /// All violations are aggregated into a single configuration error so
    /// the author sees every offending member at once.
    pub fn verify(&self) -> Result<(), OnceError> {
        let mut violations = Vec::new();

        for (name, field) in &self.fields {
            if *field == Field::Mutable {
                violations
                    .push(format!("field `{name}` must be assigned only at construction"));
            }
        }

        for (name, routing) in &self.methods {
            if *routing == Routing::Direct {
                violations.push(format!(
                    "method `{name}` is not routed through the wrapper and cannot be intercepted"
                ));
            }
        }

        for (name, property) in &self.properties {
            if property.settable && !property.intercepted_getter {
                violations.push(format!(
                    "property `{name}` is settable but its getter is not intercepted"
                ));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(OnceError::Configuration {
                type_name: self.type_name.to_string(),
                violations,
            })
        }
    }
}
