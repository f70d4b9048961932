mod alertmanager;

pub use alertmanager::{AlertManagerAlert, AlertManagerPayload, PayloadError};
