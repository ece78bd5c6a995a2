pub use nom;

mod addr;
mod body;
mod command;
mod dot;
mod linebuffer;
mod reply;

pub use addr::{Email, Hostname, Localpart, ReversePath};
pub use body::BodyType;
pub use command::{Command, MailParams, ParseError};
pub use dot::{Stuffer, UnstuffResult, Unstuffer};
pub use linebuffer::{Line, LineBuffer, LineBufferError, Terminator};
pub use reply::{Reply, ReplyAccumulator, ReplyCode, ReplyCodeKind, ReplyError};

#[cfg(test)]
use std::str;

/// Used as `println!("{:?}", show_bytes(b))`
#[cfg(test)]
pub(crate) fn show_bytes(b: &[u8]) -> String {
    if b.len() > 128 {
        "{too long}".into()
    } else if let Ok(s) = str::from_utf8(b) {
        s.into()
    } else {
        format!("{:?}", b)
    }
}
