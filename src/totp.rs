use crate::{
    uri_helper::{otp_from_uri, otp_to_uri, OTPAUTH_SCHEME},
    Otp, OtpCode, OtpError, OtpHashAlgorithm,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Totp {
    pub(crate) secret: String,
    pub(crate) algorithm: OtpHashAlgorithm,
    pub(crate) period: u64,
    pub(crate) digits: u32,
}

impl Otp for Totp {
    fn to_uri(&self, user: &str, issuer: Option<&str>) -> Result<String, OtpError> {
        otp_to_uri(self, user, issuer)
    }

    fn from_uri(uri: &str) -> Result<Self, OtpError> {
        otp_from_uri(uri)
    }
}

impl Totp {
    /// Creates the config for the [Time-based One-time Password Algorithm](http://en.wikipedia.org/wiki/Time-based_One-time_Password_Algorithm)
    /// (TOTP) given an RFC4648 base32 encoded secret.
    ///
    /// Obs.: This method defaults to the SHA1 hash, a 6-digit code and a period of 30 seconds
    pub fn new(secret: String) -> Self {
        Self {
            secret,
            algorithm: OtpHashAlgorithm::SHA1,
            period: 30,
            digits: 6,
        }
    }

    /// Builds a TOTP from whatever a user registered: either a bare base32
    /// secret or a full `otpauth://totp/...` URI.
    pub fn parse(secret: &str) -> Result<Self, OtpError> {
        let trimmed = secret.trim();

        if trimmed
            .get(..OTPAUTH_SCHEME.len())
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case(OTPAUTH_SCHEME))
        {
            return Self::from_uri(trimmed);
        }

        Ok(Self::new(trimmed.to_string()))
    }

    ///  Sets hashing algorithm
    pub fn with_algorithm(&mut self, algorithm: OtpHashAlgorithm) -> &mut Self {
        self.algorithm = algorithm;

        self
    }

    ///  Sets the period in seconds
    pub fn with_period(&mut self, period: u64) -> &mut Self {
        self.period = period;

        self
    }

    ///  Sets the number of digits to generate
    pub fn with_digits(&mut self, digits: u32) -> &mut Self {
        self.digits = digits;

        self
    }

    pub fn period(&self) -> u64 {
        self.period
    }

    /// Generates a Totp from the provided seconds since the UNIX epoch
    /// truncated to the specified number of digits
    pub fn generate(&self, seconds_since_epoch: u64) -> Result<OtpCode, OtpError> {
        if self.period == 0 {
            return Err(OtpError::InvalidPeriod);
        }

        let calculated_time = seconds_since_epoch / self.period;

        let decoded = Self::decode_secret(self.secret.as_str())?;
        let digest = self.calc_digest(decoded.as_slice(), self.algorithm, calculated_time)?;

        let code = Self::encode_digest_truncated(digest.as_ref(), self.digits)?;

        Ok(OtpCode {
            code,
            digits: self.digits,
        })
    }

    /// Seconds left before the code generated at `seconds_since_epoch` rotates.
    /// Always within `1..=period`.
    pub fn remaining_seconds(&self, seconds_since_epoch: u64) -> u64 {
        if self.period == 0 {
            return 0;
        }

        self.period - seconds_since_epoch % self.period
    }
}

/// Derives the current code for a registered secret.
///
/// Pure: the same secret and any two instants inside the same window
/// always produce the same code. Every failure, including a malformed
/// `otpauth://` URI, is reported as [`OtpError::InvalidSecret`].
pub fn derive(secret: &str, seconds_since_epoch: u64) -> Result<OtpCode, OtpError> {
    Totp::parse(secret)
        .and_then(|totp| totp.generate(seconds_since_epoch))
        .map_err(|e| match e {
            OtpError::InvalidSecret(_) => e,
            other => OtpError::InvalidSecret(other.to_string()),
        })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::{assert_eq, assert_ne};
    use rstest::{fixture, rstest};

    use crate::{
        totp::{derive, Totp},
        Otp, OtpError, OtpHashAlgorithm,
    };

    #[fixture]
    #[once]
    pub fn sha1_secret() -> String {
        "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ".to_string()
    }

    #[fixture]
    #[once]
    pub fn sha256_secret() -> String {
        "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQGEZA".to_string()
    }

    #[fixture]
    #[once]
    pub fn sha512_secret() -> String {
        "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQGEZDGNA".to_string()
    }

    #[rstest]
    #[case(sha1_secret(), "sha1", 59, "94287082")]
    #[case(sha256_secret(), "sha256", 59, "46119246")]
    #[case(sha512_secret(), "sha512", 59, "90693936")]
    #[case(sha1_secret(), "sha1", 1111111109, "07081804")]
    #[case(sha256_secret(), "sha256", 1111111109, "68084774")]
    #[case(sha512_secret(), "sha512", 1111111109, "25091201")]
    #[case(sha1_secret(), "sha1", 1234567890, "89005924")]
    #[case(sha256_secret(), "sha256", 1234567890, "91819424")]
    #[case(sha512_secret(), "sha512", 1234567890, "93441116")]
    #[case(sha1_secret(), "sha1", 20000000000, "65353130")]
    #[case(sha1_secret(), "sha1", 20000000000, "353130")]
    #[case(sha512_secret(), "sha512", 20000000000, "863826")]
    fn totp_test(
        #[case] secret: String,
        #[case] hash: OtpHashAlgorithm,
        #[case] timestamp: u64,
        #[case] expected: &str,
    ) {
        let mut totp_base = Totp::new(secret);
        totp_base
            .with_algorithm(hash)
            .with_digits(expected.len() as u32);

        let generated_otp = totp_base.generate(timestamp).unwrap();
        assert_eq!(expected, generated_otp.to_string());
    }

    #[rstest]
    #[case(1_700_000_010, 1_700_000_015)]
    #[case(1_700_000_010, 1_700_000_039)]
    #[case(0, 29)]
    fn same_window_same_code(#[case] t1: u64, #[case] t2: u64) {
        assert_eq!(derive("SECRETA", t1).unwrap(), derive("SECRETA", t2).unwrap());
    }

    #[rstest]
    #[case(1_700_000_010, 1_700_000_041, "366875", "728474")]
    #[case(1_700_000_039, 1_700_000_040, "366875", "728474")]
    fn next_window_new_code(
        #[case] t1: u64,
        #[case] t2: u64,
        #[case] first: &str,
        #[case] second: &str,
    ) {
        let before = derive("SECRETA", t1).unwrap();
        let after = derive("SECRETA", t2).unwrap();

        assert_eq!(first, before.to_string());
        assert_eq!(second, after.to_string());
        assert_ne!(before, after);
    }

    #[test]
    fn consecutive_windows_differ() {
        let codes: Vec<String> = (0..6)
            .map(|i| {
                derive(&sha1_secret(), 1_700_000_010 + 30 * i)
                    .unwrap()
                    .to_string()
            })
            .collect();

        assert_eq!(
            codes,
            vec!["732303", "136087", "253938", "250026", "398930", "310102"]
        );
    }

    #[test]
    fn derive_accepts_uri_secrets() {
        let uri = "otpauth://totp/ACME%20Co:john.doe@email.com?secret=GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ&issuer=ACME%20Co&digits=8";

        assert_eq!("94287082", derive(uri, 59).unwrap().to_string());
    }

    #[test]
    fn derive_reports_invalid_secret() {
        assert!(matches!(
            derive("this is not base32!", 59),
            Err(OtpError::InvalidSecret(_))
        ));
    }

    #[test]
    fn zero_period_is_rejected() {
        let mut totp = Totp::new(sha1_secret());
        totp.with_period(0);

        assert_eq!(totp.generate(59), Err(OtpError::InvalidPeriod));
    }

    #[rstest]
    #[case(0, 30)]
    #[case(1, 29)]
    #[case(29, 1)]
    #[case(30, 30)]
    #[case(59, 1)]
    fn remaining_seconds_test(#[case] now: u64, #[case] expected: u64) {
        let totp = Totp::new(sha1_secret());

        assert_eq!(expected, totp.remaining_seconds(now));
    }

    #[rstest]
    #[case("sha1", 6, 30,
        "otpauth://totp/ACME%20Co:john.doe@email.com?secret=HXDMVJECJJWSRB3HWIZR4IFUGFTMXBOZ&issuer=ACME+Co&algorithm=SHA1&digits=6&period=30")]
    #[case("sha512", 6, 10,
        "otpauth://totp/ACME%20Co:john.doe@email.com?secret=HXDMVJECJJWSRB3HWIZR4IFUGFTMXBOZ&issuer=ACME+Co&algorithm=SHA512&digits=6&period=10")]
    fn to_uri_test(
        #[case] hash: OtpHashAlgorithm,
        #[case] digits: u32,
        #[case] period: u64,
        #[case] expected: &str,
    ) {
        let mut totp_base = Totp::new("HXDMVJECJJWSRB3HWIZR4IFUGFTMXBOZ".to_string());
        totp_base
            .with_algorithm(hash)
            .with_period(period)
            .with_digits(digits);

        let generated_uri = totp_base
            .to_uri("john.doe@email.com", Some("ACME Co"))
            .unwrap();

        assert_eq!(expected, generated_uri)
    }

    #[rstest]
    #[case("sha256", 8, 30,
        "otpauth://totp/ACME%20Co:john.doe@email.com?secret=HXDMVJECJJWSRB3HWIZR4IFUGFTMXBOZ&issuer=ACME+Co&algorithm=SHA256&digits=8&period=30")]
    #[case("sha1", 6, 30, "OTPAUTH://totp/john?secret=HXDMVJECJJWSRB3HWIZR4IFUGFTMXBOZ")]
    fn parse_uri_test(
        #[case] hash: OtpHashAlgorithm,
        #[case] digits: u32,
        #[case] period: u64,
        #[case] input_uri: &str,
    ) {
        let mut expected_totp = Totp::new("HXDMVJECJJWSRB3HWIZR4IFUGFTMXBOZ".to_string());
        expected_totp
            .with_algorithm(hash)
            .with_period(period)
            .with_digits(digits);

        assert_eq!(expected_totp, Totp::parse(input_uri).unwrap());
    }

    #[rstest]
    #[case::bad_digits("otpauth://totp/github?secret=SECRETA&digits=six")]
    #[case::hotp("otpauth://hotp/github?secret=SECRETA&counter=1")]
    #[case::zero_period("otpauth://totp/github?secret=SECRETA&period=0")]
    fn derive_reports_broken_uris_as_invalid_secrets(#[case] secret: &str) {
        assert!(matches!(
            derive(secret, 1_700_000_010),
            Err(OtpError::InvalidSecret(_))
        ));
    }

    #[test]
    fn parse_bare_secret() {
        assert_eq!(
            Totp::new("SECRETA".to_string()),
            Totp::parse("  SECRETA\n").unwrap()
        );
    }
}
