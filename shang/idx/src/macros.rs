/// Implement [IndexRef](crate::IndexRef) for a newtype around a `u32`.
///
/// With a second argument the index also gets a `Display` impl printing the
/// given prefix followed by the number, e.g. `impl_index!(NodeIdx, "n")`
/// prints `n4`.
#[macro_export]
macro_rules! impl_index {
    ($name: ident) => {
        impl $crate::IndexRef for $name {
            fn index(&self) -> usize {
                self.0 as usize
            }

            fn new(input: usize) -> Self {
                $name(input as u32)
            }
        }

        impl From<u32> for $name {
            fn from(input: u32) -> Self {
                $name(input)
            }
        }
    };

    ($name: ident, $prefix: literal) => {
        $crate::impl_index!($name);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}
