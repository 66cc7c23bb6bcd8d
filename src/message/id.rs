use std::fmt;
use std::ops::Deref;

/// Length error for the inline-array identifier types below.
pub struct InvalidLength(&'static str, usize, usize);

impl fmt::Debug for InvalidLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for InvalidLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Incorrect {} length: {} exceeds {}",
            self.0, self.2, self.1
        )
    }
}

macro_rules! var_array {
    ($name:ident, $max:expr) => {
        /// Variable-length identifier stored inline, no allocation.
        #[derive(Clone, Copy)]
        pub struct $name([u8; $max], usize);

        impl $name {
            pub fn try_new(data: &[u8]) -> Result<Self, InvalidLength> {
                if data.len() > $max {
                    return Err(InvalidLength(stringify!($name), $max, data.len()));
                }
                let mut array = [0; $max];
                array[..data.len()].copy_from_slice(data);
                Ok($name(array, data.len()))
            }

            pub fn empty() -> Self {
                $name([0; $max], 0)
            }

            pub fn is_empty(&self) -> bool {
                self.1 == 0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:02x?})", stringify!($name), &self.0[..self.1])
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.deref() == other.deref()
            }
        }

        impl Eq for $name {}

        impl std::hash::Hash for $name {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                self.deref().hash(state);
            }
        }

        impl Deref for $name {
            type Target = [u8];

            fn deref(&self) -> &Self::Target {
                &self.0[..self.1]
            }
        }

        impl<'a> TryFrom<&'a [u8]> for $name {
            type Error = InvalidLength;

            fn try_from(value: &'a [u8]) -> Result<Self, Self::Error> {
                Self::try_new(value)
            }
        }
    };
}

var_array!(SessionId, 32);
var_array!(Cookie, 255);

/// The 32-byte client/server random.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Random([u8; 32]);

impl Random {
    pub fn new(data: &[u8]) -> Result<Self, InvalidLength> {
        if data.len() != 32 {
            return Err(InvalidLength("Random", 32, data.len()));
        }
        let mut array = [0; 32];
        array.copy_from_slice(data);
        Ok(Random(array))
    }
}

impl fmt::Debug for Random {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Random({:02x?})", &self.0)
    }
}

impl Deref for Random {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_bounds() {
        assert!(SessionId::try_new(&[0u8; 32]).is_ok());
        assert!(SessionId::try_new(&[0u8; 33]).is_err());
        assert!(SessionId::empty().is_empty());
    }

    #[test]
    fn cookie_equality_is_content_based() {
        let a = Cookie::try_new(b"cookie456").unwrap();
        let b = Cookie::try_new(b"cookie456").unwrap();
        let c = Cookie::try_new(b"cookie457").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn random_requires_exactly_32() {
        assert!(Random::new(&[0u8; 32]).is_ok());
        assert!(Random::new(&[0u8; 31]).is_err());
        assert!(Random::new(&[0u8; 33]).is_err());
    }
}
