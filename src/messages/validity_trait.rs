// Validity checks applied while parsing received messages.
pub trait Validity {
  fn valid(&self) -> bool;
}
