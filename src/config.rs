//! Tunable parameters of a map instance.

const DEFAULT_INIT_CAPACITY: usize = 16;
const DEFAULT_LOAD_FACTOR_PCT: usize = 75;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Config
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Runtime configuration parameters.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    init_capacity: usize,
    load_factor_pct: usize,
}

/********** impl Default **************************************************************************/

impl Default for Config {
    #[inline]
    fn default() -> Self {
        ConfigBuilder::new().build()
    }
}

/********** impl inherent *************************************************************************/

impl Config {
    /// Creates a new [`Config`] with the given parameters.
    ///
    /// # Panics
    ///
    /// This function panics if `init_capacity` is not a power of two or if
    /// `load_factor_pct` lies outside `1..=100`.
    #[inline]
    pub fn with_params(init_capacity: usize, load_factor_pct: usize) -> Self {
        assert!(init_capacity.is_power_of_two(), "initial capacity must be a power of two");
        assert!(
            load_factor_pct >= 1 && load_factor_pct <= 100,
            "load factor must be a percentage in 1..=100"
        );
        Self { init_capacity, load_factor_pct }
    }

    /// Returns the initial size of the bucket array.
    #[inline]
    pub fn init_capacity(&self) -> usize {
        self.init_capacity
    }

    /// Returns the fill percentage above which the bucket array is doubled.
    #[inline]
    pub fn load_factor_pct(&self) -> usize {
        self.load_factor_pct
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ConfigBuilder
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A builder type for gradually initializing a [`Config`].
#[derive(Copy, Clone, Debug, Default)]
pub struct ConfigBuilder {
    init_capacity: Option<usize>,
    load_factor_pct: Option<usize>,
}

/********** impl inherent *************************************************************************/

impl ConfigBuilder {
    /// Creates a new [`ConfigBuilder`] with default values.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial size of the bucket array (must be a power of two).
    #[inline]
    pub fn init_capacity(mut self, init_capacity: usize) -> Self {
        self.init_capacity = Some(init_capacity);
        self
    }

    /// Sets the resize threshold as a fill percentage.
    #[inline]
    pub fn load_factor_pct(mut self, load_factor_pct: usize) -> Self {
        self.load_factor_pct = Some(load_factor_pct);
        self
    }

    /// Consumes the [`ConfigBuilder`] and returns an initialized [`Config`].
    ///
    /// Unspecified parameters are initialized with their default values.
    ///
    /// # Panics
    ///
    /// See [`Config::with_params`].
    #[inline]
    pub fn build(self) -> Config {
        Config::with_params(
            self.init_capacity.unwrap_or(DEFAULT_INIT_CAPACITY),
            self.load_factor_pct.unwrap_or(DEFAULT_LOAD_FACTOR_PCT),
        )
    }
}
