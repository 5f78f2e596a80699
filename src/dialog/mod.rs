//! Dialog layer: long-lived peer relationships identified by Call-ID and
//! the two tags, in-dialog request construction, and the client flows
//! built on top (INVITE, REGISTER).

pub mod authenticate;
pub mod client_dialog;
pub mod dialog;
pub mod dialog_layer;
pub mod invitation;
pub mod registration;
pub mod server_dialog;

#[cfg(test)]
mod tests;

use crate::message::{Request, Response};
use crate::{Error, Result};
use std::fmt;

/// Dialog identifier: Call-ID plus the From and To tags of the initial
/// request, in that orientation. In-dialog requests from the peer arrive
/// with the tags swapped; [`DialogId::swapped`] covers the lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
}

impl DialogId {
    pub fn swapped(&self) -> DialogId {
        DialogId {
            call_id: self.call_id.clone(),
            from_tag: self.to_tag.clone(),
            to_tag: self.from_tag.clone(),
        }
    }
}

impl TryFrom<&Request> for DialogId {
    type Error = Error;

    fn try_from(request: &Request) -> Result<DialogId> {
        let call_id = request.headers.call_id()?.to_string();
        let from_tag = request
            .headers
            .from_header()?
            .tag()
            .unwrap_or_default()
            .to_string();
        let to_tag = request
            .headers
            .to_header()?
            .tag()
            .unwrap_or_default()
            .to_string();
        Ok(DialogId {
            call_id,
            from_tag,
            to_tag,
        })
    }
}

impl TryFrom<&Response> for DialogId {
    type Error = Error;

    fn try_from(response: &Response) -> Result<DialogId> {
        let call_id = response.headers.call_id()?.to_string();
        let from_tag = response
            .headers
            .from_header()?
            .tag()
            .unwrap_or_default()
            .to_string();
        let to_tag = response
            .headers
            .to_header()?
            .tag()
            .unwrap_or_default()
            .to_string();
        Ok(DialogId {
            call_id,
            from_tag,
            to_tag,
        })
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.call_id, self.from_tag, self.to_tag)
    }
}
