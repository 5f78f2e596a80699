use std::fmt;

/// Response status class, derived from the hundreds digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Provisional,
    Successful,
    Redirection,
    RequestFailure,
    ServerFailure,
    GlobalFailure,
}

/// SIP response status codes.
///
/// Codes without a named variant round-trip through `Other`; the canonical
/// reason phrase is used on serialization when the wire did not carry one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Trying,
    Ringing,
    CallIsBeingForwarded,
    SessionProgress,
    OK,
    Accepted,
    MovedPermanently,
    MovedTemporarily,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    NotAcceptable,
    ProxyAuthenticationRequired,
    RequestTimeout,
    Gone,
    IntervalTooBrief,
    TemporarilyUnavailable,
    CallTransactionDoesNotExist,
    BusyHere,
    RequestTerminated,
    NotAcceptableHere,
    ServerInternalError,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
    BusyEverywhere,
    Decline,
    Other(u16),
}

impl StatusCode {
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Trying => 100,
            StatusCode::Ringing => 180,
            StatusCode::CallIsBeingForwarded => 181,
            StatusCode::SessionProgress => 183,
            StatusCode::OK => 200,
            StatusCode::Accepted => 202,
            StatusCode::MovedPermanently => 301,
            StatusCode::MovedTemporarily => 302,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::NotAcceptable => 406,
            StatusCode::ProxyAuthenticationRequired => 407,
            StatusCode::RequestTimeout => 408,
            StatusCode::Gone => 410,
            StatusCode::IntervalTooBrief => 423,
            StatusCode::TemporarilyUnavailable => 480,
            StatusCode::CallTransactionDoesNotExist => 481,
            StatusCode::BusyHere => 486,
            StatusCode::RequestTerminated => 487,
            StatusCode::NotAcceptableHere => 488,
            StatusCode::ServerInternalError => 500,
            StatusCode::NotImplemented => 501,
            StatusCode::BadGateway => 502,
            StatusCode::ServiceUnavailable => 503,
            StatusCode::BusyEverywhere => 600,
            StatusCode::Decline => 603,
            StatusCode::Other(code) => *code,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            StatusCode::Trying => "Trying",
            StatusCode::Ringing => "Ringing",
            StatusCode::CallIsBeingForwarded => "Call Is Being Forwarded",
            StatusCode::SessionProgress => "Session Progress",
            StatusCode::OK => "OK",
            StatusCode::Accepted => "Accepted",
            StatusCode::MovedPermanently => "Moved Permanently",
            StatusCode::MovedTemporarily => "Moved Temporarily",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::NotAcceptable => "Not Acceptable",
            StatusCode::ProxyAuthenticationRequired => "Proxy Authentication Required",
            StatusCode::RequestTimeout => "Request Timeout",
            StatusCode::Gone => "Gone",
            StatusCode::IntervalTooBrief => "Interval Too Brief",
            StatusCode::TemporarilyUnavailable => "Temporarily Unavailable",
            StatusCode::CallTransactionDoesNotExist => "Call/Transaction Does Not Exist",
            StatusCode::BusyHere => "Busy Here",
            StatusCode::RequestTerminated => "Request Terminated",
            StatusCode::NotAcceptableHere => "Not Acceptable Here",
            StatusCode::ServerInternalError => "Server Internal Error",
            StatusCode::NotImplemented => "Not Implemented",
            StatusCode::BadGateway => "Bad Gateway",
            StatusCode::ServiceUnavailable => "Service Unavailable",
            StatusCode::BusyEverywhere => "Busy Everywhere",
            StatusCode::Decline => "Decline",
            StatusCode::Other(_) => "Unknown",
        }
    }

    pub fn kind(&self) -> StatusKind {
        match self.code() / 100 {
            1 => StatusKind::Provisional,
            2 => StatusKind::Successful,
            3 => StatusKind::Redirection,
            4 => StatusKind::RequestFailure,
            5 => StatusKind::ServerFailure,
            _ => StatusKind::GlobalFailure,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.kind() == StatusKind::Provisional
    }

    pub fn is_final(&self) -> bool {
        !self.is_provisional()
    }

    pub fn is_success(&self) -> bool {
        self.kind() == StatusKind::Successful
    }
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        match code {
            100 => StatusCode::Trying,
            180 => StatusCode::Ringing,
            181 => StatusCode::CallIsBeingForwarded,
            183 => StatusCode::SessionProgress,
            200 => StatusCode::OK,
            202 => StatusCode::Accepted,
            301 => StatusCode::MovedPermanently,
            302 => StatusCode::MovedTemporarily,
            400 => StatusCode::BadRequest,
            401 => StatusCode::Unauthorized,
            403 => StatusCode::Forbidden,
            404 => StatusCode::NotFound,
            405 => StatusCode::MethodNotAllowed,
            406 => StatusCode::NotAcceptable,
            407 => StatusCode::ProxyAuthenticationRequired,
            408 => StatusCode::RequestTimeout,
            410 => StatusCode::Gone,
            423 => StatusCode::IntervalTooBrief,
            480 => StatusCode::TemporarilyUnavailable,
            481 => StatusCode::CallTransactionDoesNotExist,
            486 => StatusCode::BusyHere,
            487 => StatusCode::RequestTerminated,
            488 => StatusCode::NotAcceptableHere,
            500 => StatusCode::ServerInternalError,
            501 => StatusCode::NotImplemented,
            502 => StatusCode::BadGateway,
            503 => StatusCode::ServiceUnavailable,
            600 => StatusCode::BusyEverywhere,
            603 => StatusCode::Decline,
            other => StatusCode::Other(other),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
