use std::time::SystemTime;

use bytes::Bytes;
use httpdate::fmt_http_date;

use crate::SOFTWARE;

/// Canned error responses the proxy emits on its own behalf: fixed status
/// line, `Server` and `Date` headers, empty body.
fn template(status: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 {status}\r\n\
         Server: {SOFTWARE}\r\n\
         Date: {}\r\n\
         Content-Length: 0\r\n\r\n",
        fmt_http_date(SystemTime::now()),
    ))
}

pub fn bad_request() -> Bytes {
    template("400 Bad Request")
}

pub fn header_too_large() -> Bytes {
    template("431 Request Header Fields Too Large")
}

pub fn bad_gateway() -> Bytes {
    template("502 Bad Gateway")
}

pub fn service_unavailable() -> Bytes {
    template("503 Service Unavailable")
}

pub fn version_not_supported() -> Bytes {
    template("505 HTTP Version Not Supported")
}
