pub mod admission;
pub mod auth;
pub mod custom;
pub mod graphql;
pub mod identity;
pub mod responders;
pub mod transform;
pub mod upstream_auth;
