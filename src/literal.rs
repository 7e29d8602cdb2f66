//! Helper types for making the construction of query, sort, etc. documents
//! a little less stringly-typed.

use bson::Bson;

/// Ordering, for specifying in which order to sort results yielded by a query.
/// ```
/// # #[macro_use]
/// # extern crate bson;
/// # extern crate medlar;
/// #
/// # use medlar::literal::Order;
/// #
/// # fn main() {
/// let sorting = doc! {
///     "_id": Order::Ascending,
///     "zip": Order::Descending,
/// };
/// assert_eq!(sorting, doc!{
///     "_id":  1,
///     "zip": -1,
/// });
/// # }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Order {
    /// Order smaller values first.
    Ascending  =  1,
    /// Order greater values first.
    Descending = -1,
}

impl Order {
    /// Recovers an ordering from the `±1` convention of a sort document.
    /// Accepts any numeric representation; everything else is `None`.
    #[allow(clippy::float_cmp, clippy::cast_lossless)]
    pub fn from_bson(bson: &Bson) -> Option<Self> {
        let direction = match *bson {
            Bson::I32(n) => n as i64,
            Bson::I64(n) => n,
            Bson::FloatingPoint(x) if x ==  1.0 =>  1,
            Bson::FloatingPoint(x) if x == -1.0 => -1,
            _ => return None,
        };

        match direction {
             1 => Some(Order::Ascending),
            -1 => Some(Order::Descending),
             _ => None,
        }
    }
}

/// The default ordering is `Ascending`.
impl Default for Order {
    fn default() -> Self {
        Order::Ascending
    }
}

/// This impl is provided so that you can use these more expressive ordering
/// names instead of the not very clear `1` and `-1` when constructing literal
/// sort documents.
impl From<Order> for Bson {
    fn from(order: Order) -> Self {
        Bson::I32(order as _)
    }
}

bitflags! {
    /// The value kinds of the document model, as a mask. Kinds are what the
    /// total order ranks and what restricts `$lt`-style comparisons: two
    /// values are only ever compared when their kinds agree.
    ///
    /// ```
    /// # extern crate bson;
    /// # extern crate medlar;
    /// #
    /// # use bson::Bson;
    /// # use medlar::literal::BsonType;
    /// # use medlar::ext::BsonExt;
    /// #
    /// # fn main() {
    /// assert_eq!(Bson::I64(7).bson_type(), BsonType::LONG);
    /// assert!(BsonType::COMPARABLE.contains(Bson::I64(7).bson_type()));
    /// assert!(!BsonType::COMPARABLE.contains(Bson::Boolean(true).bson_type()));
    /// # }
    /// ```
    pub struct BsonType: u16 {
        /// The `null` value.
        const NULL     = 0b0000_0000_0001;
        /// `true` or `false`.
        const BOOL     = 0b0000_0000_0010;
        /// Double-precision floating-point number.
        const DOUBLE   = 0b0000_0000_0100;
        /// 32-bit signed integer.
        const INT      = 0b0000_0000_1000;
        /// 64-bit signed integer.
        const LONG     = 0b0000_0001_0000;
        /// Any of the numeric representations; one kind for comparisons.
        const NUMBER   = 0b0000_0001_1100;
        /// String.
        const STRING   = 0b0000_0010_0000;
        /// Date and time.
        const DATE     = 0b0000_0100_0000;
        /// Regular expression; legal in queries only, never in documents.
        const REGEX    = 0b0000_1000_0000;
        /// Array.
        const ARRAY    = 0b0001_0000_0000;
        /// Document or object.
        const DOCUMENT = 0b0010_0000_0000;
        /// BSON variants the document model rejects (binary, ObjectId, ...).
        const FOREIGN  = 0b0100_0000_0000;

        /// Kinds admitted by the ordering comparison operators
        /// (`$lt`, `$lte`, `$gt`, `$gte`).
        const COMPARABLE = Self::NUMBER.bits | Self::STRING.bits | Self::DATE.bits;
    }
}

/// The default BSON type is `null`.
impl Default for BsonType {
    fn default() -> Self {
        BsonType::NULL
    }
}

bitflags! {
    /// Options for matching text against a regular expression.
    /// Useful with the `$regex` operator. E.g.:
    ///
    /// ```
    /// # #[macro_use]
    /// # extern crate bson;
    /// # extern crate medlar;
    /// #
    /// # use bson::Bson;
    /// # use medlar::literal::{ regex, RegexOpts };
    /// #
    /// # fn main() {
    /// let query = doc!{
    ///     "name": {
    ///         "$regex": regex("^Foo", RegexOpts::LINE_ANCHOR | RegexOpts::IGNORE_CASE),
    ///     },
    ///     "address": {
    ///         "$regex": regex(".* street$", RegexOpts::default()),
    ///     },
    /// };
    /// assert_eq!(query, doc!{
    ///     "name": {
    ///         "$regex": Bson::RegExp("^Foo".into(), "im".into()),
    ///     },
    ///     "address": {
    ///         "$regex": Bson::RegExp(".* street$".into(), "".into()),
    ///     },
    /// });
    /// # }
    /// ```
    #[derive(Default)]
    pub struct RegexOpts: u8 {
        /// Case insensitive matching.
        const IGNORE_CASE = 0b0000_0001;
        /// `^` and `$` match the beginning and the end of lines, not the whole string.
        const LINE_ANCHOR = 0b0000_0010;
        /// "extended" syntax, allows embedded whitespace and `#`-comments
        const EXTENDED    = 0b0000_0100;
        /// The `.` character matches newlines too.
        const DOT_NEWLINE = 0b0000_1000;
    }
}

/// Flag characters in the order they appear in an options string.
static OPTION_CHARS: &[(RegexOpts, char)] = &[
    (RegexOpts::IGNORE_CASE, 'i'),
    (RegexOpts::LINE_ANCHOR, 'm'),
    (RegexOpts::DOT_NEWLINE, 's'),
    (RegexOpts::EXTENDED,    'x'),
];

impl RegexOpts {
    /// Renders the flags as a canonical options string, e.g. `"im"`.
    pub fn to_option_string(self) -> String {
        OPTION_CHARS
            .iter()
            .filter(|&&(flag, _)| self.contains(flag))
            .map(|&(_, ch)| ch)
            .collect()
    }

    /// Parses an options string back into flags. Unknown characters yield
    /// `None`; duplicates are tolerated.
    pub fn from_option_string(options: &str) -> Option<Self> {
        let mut flags = RegexOpts::empty();

        for ch in options.chars() {
            match OPTION_CHARS.iter().find(|&&(_, known)| known == ch) {
                Some(&(flag, _)) => flags |= flag,
                None => return None,
            }
        }

        Some(flags)
    }
}

/// Constructs a regular expression literal for use as a `$regex` argument
/// (or as a bare query value, which matches the same way).
pub fn regex<S: Into<String>>(pattern: S, options: RegexOpts) -> Bson {
    Bson::RegExp(pattern.into(), options.to_option_string())
}
