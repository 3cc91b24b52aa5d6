//! Shapes a handler factory may resolve to.

/// A loaded unit that exposes its handler under a conventional `default` slot.
///
/// Factories that wrap a dynamically loaded module can return this instead of
/// the bare handler; the gate unwraps it before installing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module<H> {
   pub default: H,
}

/// Normalized factory result: either the handler itself or a [`Module`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Export<H> {
   Handler(H),
   Module(Module<H>),
}

impl<H> Export<H> {
   /// Unwraps to the inner handler, whichever shape it arrived in.
   #[inline]
   pub fn into_handler(self) -> H {
      match self {
         Export::Handler(handler) => handler,
         Export::Module(module) => module.default,
      }
   }
}

impl<H> From<H> for Export<H> {
   #[inline]
   fn from(handler: H) -> Self {
      Export::Handler(handler)
   }
}

impl<H> From<Module<H>> for Export<H> {
   #[inline]
   fn from(module: Module<H>) -> Self {
      Export::Module(module)
   }
}
