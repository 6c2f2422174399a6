mod helper;
mod lifecycle;
mod reconnect;
mod validation;
