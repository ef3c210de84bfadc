/// Newline byte
pub(crate) const LF: u8 = b'\n';
/// Carriage return byte
pub(crate) const CR: u8 = b'\r';
/// Field separator
pub(crate) const COLON: u8 = b':';
/// Optional single space after the separator
pub(crate) const SPACE: u8 = b' ';
