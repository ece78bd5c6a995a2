use std::{fmt, str::FromStr};

/// The message body discriminant, as negotiated by MAIL BODY= / SMTPUTF8 and
/// recorded in the spool envelope.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BodyType {
    SevenBit,
    EightBitMime,
    BinaryMime,
    Smtputf8,
}

impl BodyType {
    /// The value of the MAIL BODY= parameter, uppercase per RFC-6152/3030.
    /// SMTPUTF8 is not a BODY= value; it rides its own parameter.
    pub fn as_mail_parameter(self) -> Option<&'static str> {
        match self {
            BodyType::SevenBit => Some("7BIT"),
            BodyType::EightBitMime => Some("8BITMIME"),
            BodyType::BinaryMime => Some("BINARYMIME"),
            BodyType::Smtputf8 => Some("8BITMIME"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BodyType::SevenBit => "7bit",
            BodyType::EightBitMime => "8bitmime",
            BodyType::BinaryMime => "binarymime",
            BodyType::Smtputf8 => "smtputf8",
        }
    }

    pub fn from_mail_parameter(s: &str) -> Option<BodyType> {
        if s.eq_ignore_ascii_case("7BIT") {
            Some(BodyType::SevenBit)
        } else if s.eq_ignore_ascii_case("8BITMIME") {
            Some(BodyType::EightBitMime)
        } else if s.eq_ignore_ascii_case("BINARYMIME") {
            Some(BodyType::BinaryMime)
        } else {
            None
        }
    }
}

impl fmt::Display for BodyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BodyType {
    type Err = ();

    fn from_str(s: &str) -> Result<BodyType, ()> {
        match s {
            "7bit" => Ok(BodyType::SevenBit),
            "8bitmime" => Ok(BodyType::EightBitMime),
            "binarymime" => Ok(BodyType::BinaryMime),
            "smtputf8" => Ok(BodyType::Smtputf8),
            _ => Err(()),
        }
    }
}
