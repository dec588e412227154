/// An opaque identifier handed to the reactor on registration and echoed
/// back on every readiness event for that registration.
///
/// A transparent `usize` newtype. The AICP core
/// uses it to carry an [`AicoRef`](crate::aico::AicoRef) arena index through
/// a backend and back out again, so the worker can recover which `Aico` a
/// readiness event belongs to without a side table (epoll and kqueue both
/// echo it back verbatim; the `poll(2)` backend keeps its own fd -> token
/// map since the kernel doesn't echo anything).
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Token(pub usize);

impl Token {
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl From<usize> for Token {
    fn from(v: usize) -> Token {
        Token(v)
    }
}

impl From<Token> for usize {
    fn from(t: Token) -> usize {
        t.0
    }
}
