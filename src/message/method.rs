use std::fmt;
use std::str::FromStr;

/// SIP request methods understood by this stack.
///
/// The RFC 3261 six plus the extension methods the user agent routes
/// through the non-INVITE machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Info,
    Prack,
    Update,
    Refer,
    Notify,
    Subscribe,
    Message,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Info => "INFO",
            Method::Prack => "PRACK",
            Method::Update => "UPDATE",
            Method::Refer => "REFER",
            Method::Notify => "NOTIFY",
            Method::Subscribe => "SUBSCRIBE",
            Method::Message => "MESSAGE",
        }
    }

    /// Requests that update the dialog's remote target on receipt.
    pub fn is_target_refresh(&self) -> bool {
        matches!(self, Method::Invite | Method::Update)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INVITE" => Ok(Method::Invite),
            "ACK" => Ok(Method::Ack),
            "BYE" => Ok(Method::Bye),
            "CANCEL" => Ok(Method::Cancel),
            "REGISTER" => Ok(Method::Register),
            "OPTIONS" => Ok(Method::Options),
            "INFO" => Ok(Method::Info),
            "PRACK" => Ok(Method::Prack),
            "UPDATE" => Ok(Method::Update),
            "REFER" => Ok(Method::Refer),
            "NOTIFY" => Ok(Method::Notify),
            "SUBSCRIBE" => Ok(Method::Subscribe),
            "MESSAGE" => Ok(Method::Message),
            other => Err(crate::Error::ProtocolError(format!(
                "unknown method: {}",
                other
            ))),
        }
    }
}
