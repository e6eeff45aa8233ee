/// A named observation attribute with a real value
///
/// This is the boundary type used when appending training data or tagging:
/// attribute names are interned into an [`Alphabet`](crate::Alphabet) before
/// they reach the inference core, which only sees dense ids.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    /// Attribute name
    pub name: String,
    /// Value of the attribute
    pub value: f64,
}

impl Attribute {
    /// Create a new attribute with a name and value
    pub fn new<T: Into<String>>(name: T, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

impl From<&str> for Attribute {
    fn from(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: 1.0,
        }
    }
}

impl<S: Into<String>> From<(S, f64)> for Attribute {
    fn from((name, value): (S, f64)) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_creation() {
        let attr1 = Attribute::new("walk", 1.0);
        assert_eq!(attr1.name, "walk");
        assert_eq!(attr1.value, 1.0);

        let attr2 = Attribute::from("shop");
        assert_eq!(attr2.value, 1.0);

        let attr3 = Attribute::from(("clean", 0.5));
        assert_eq!(attr3.name, "clean");
        assert_eq!(attr3.value, 0.5);
    }
}
