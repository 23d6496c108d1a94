//! Client for the streaming session backend.
//!
//! The backend allocates a remote rendering process per session and reports the
//! network routes needed to reach it. [`SessionService`] is the seam the
//! lifecycle controller talks to; [`HttpSessionClient`] is the real
//! implementation.

pub mod client;
pub mod routes;

pub use client::{DestroyReply, HttpSessionClient, SessionReply, SessionService};
pub use routes::{
    CreateSessionRequest, StreamItem, StreamList, StreamRoute, StreamRoutes, extract_endpoint,
};
