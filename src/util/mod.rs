pub mod http;
pub mod io;
