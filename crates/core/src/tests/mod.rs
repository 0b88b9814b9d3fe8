mod support;
mod wifi;
