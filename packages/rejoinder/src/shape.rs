//! Expected shapes of success payloads.
//!
//! Each operation carries a shape. When the transport delivers what looks like a success, the
//! dispatcher checks it against the shape first, and completes the operation with an
//! [`InvalidResponse`](crate::ErrorKind::InvalidResponse) failure if it doesn't match.

use bundle::{Bundle, BundleError};


/// Check that a success payload has the fields a caller will pull out of it
pub trait ResponseShape: Send + Sync + 'static {
    fn check(&self, payload: &Bundle) -> Result<(), BundleError>;
}

/// Shape that accepts any payload.
#[derive(Debug, Copy, Clone, Default)]
pub struct AnyShape;

impl ResponseShape for AnyShape {
    fn check(&self, _payload: &Bundle) -> Result<(), BundleError> {
        Ok(())
    }
}

/// Shape that requires certain keys to be present, of any type.
#[derive(Debug, Clone)]
pub struct RequiredKeys(pub &'static [&'static str]);

impl ResponseShape for RequiredKeys {
    fn check(&self, payload: &Bundle) -> Result<(), BundleError> {
        match self.0.iter().find(|key| !payload.contains_key(key)) {
            Some(key) => Err(BundleError::Missing { key: (*key).to_owned() }),
            None => Ok(()),
        }
    }
}

impl<F> ResponseShape for F
where
    F: Fn(&Bundle) -> Result<(), BundleError> + Send + Sync + 'static,
{
    fn check(&self, payload: &Bundle) -> Result<(), BundleError> {
        self(payload)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use bundle::bundle;

    #[test]
    fn required_keys() {
        let shape = RequiredKeys(&["accountName", "accountType"]);
        assert!(shape.check(&bundle! { "accountName" => "a", "accountType" => "t" }).is_ok());
        assert_eq!(
            shape.check(&bundle! { "accountName" => "a" }),
            Err(BundleError::Missing { key: "accountType".into() }),
        );
    }

    #[test]
    fn closure_shape_checks_types() {
        let shape = |b: &Bundle| b.get_bool("booleanResult").map(drop);
        assert!(shape.check(&bundle! { "booleanResult" => true }).is_ok());
        assert!(matches!(
            shape.check(&bundle! { "booleanResult" => "true" }),
            Err(BundleError::WrongType { .. }),
        ));
        assert!(AnyShape.check(&Bundle::new()).is_ok());
    }
}
