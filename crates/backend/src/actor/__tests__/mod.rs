pub(crate) mod helpers;
mod instance;
mod registry;
mod supervisor;
