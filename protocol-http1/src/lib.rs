//! Sans-IO HTTP/1.1 client codec.
//!
//! This crate provides the wire half of an HTTP/1.1 client without owning
//! any sockets:
//!
//! - **Requests**: serialize a request line, headers, and body with
//!   [`encode_request`].
//! - **Responses**: feed received bytes into a [`ResponseDecoder`] and pull
//!   out [`Decoded`] items (head, body chunks, end of message) as they become
//!   available.
//!
//! Supported body framings are `content-length`, `transfer-encoding:
//! chunked`, read-until-close, and the bodiless responses (HEAD requests,
//! `204`, `304`). Interim `1xx` responses are skipped.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use protocol_http1::{Decoded, RequestHead, ResponseDecoder, encode_request};
//!
//! let mut wire = Vec::new();
//! let head = RequestHead::new("GET", "/", "example.com");
//! encode_request(&head, &[], &mut wire);
//! assert!(wire.starts_with(b"GET / HTTP/1.1\r\n"));
//!
//! let mut decoder = ResponseDecoder::new();
//! let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nhi"[..]);
//!
//! let Some(Decoded::Head(head)) = decoder.decode(&mut buf).unwrap() else { panic!() };
//! assert_eq!(head.status, 200);
//! let Some(Decoded::Body(body)) = decoder.decode(&mut buf).unwrap() else { panic!() };
//! assert_eq!(&body[..], b"hi");
//! assert!(matches!(decoder.decode(&mut buf).unwrap(), Some(Decoded::End)));
//! ```

mod error;
mod request;
mod response;

pub use error::ParseError;
pub use request::{RequestHead, encode_request};
pub use response::{
    BodyKind, DEFAULT_MAX_HEAD_SIZE, Decoded, ResponseDecoder, ResponseHead, Version,
};
