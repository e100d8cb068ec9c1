use std::{borrow::Cow, str::FromStr};

use crate::{totp::Totp, OtpError, OtpHashAlgorithm};

pub(crate) const OTPAUTH_SCHEME: &str = "otpauth://";

const TOTP_TYPE: &str = "totp";

const URI_SECRET_QUERY: &str = "secret";
const URI_ISSUER_QUERY: &str = "issuer";
const URI_HASH_QUERY: &str = "algorithm";
const URI_PERIOD_QUERY: &str = "period";
const URI_DIGITS_QUERY: &str = "digits";

pub fn otp_from_uri(uri: &str) -> Result<Totp, OtpError> {
    let uri = url::Url::parse(uri).map_err(OtpError::UriParseError)?;

    let domain = uri.domain();
    if domain.is_none() || domain.is_some_and(|d| !d.eq_ignore_ascii_case(TOTP_TYPE)) {
        return Err(OtpError::InvalidUriType(
            domain.unwrap_or("None").into(),
            TOTP_TYPE.into(),
        ));
    }

    let mut secret = "".to_string();
    let mut algorithm = OtpHashAlgorithm::default();
    let mut period = 30;
    let mut digits = 6;

    for params in uri.query_pairs() {
        match params.0 {
            Cow::Borrowed(URI_SECRET_QUERY) => secret = params.1.to_string(),
            Cow::Borrowed(URI_HASH_QUERY) => {
                algorithm = OtpHashAlgorithm::from_str(params.1.as_ref())?
            }
            Cow::Borrowed(URI_PERIOD_QUERY) => {
                period = u64::from_str(params.1.as_ref())
                    .map_err(|e| OtpError::IntegerParseError(e, URI_PERIOD_QUERY.into()))?
            }
            Cow::Borrowed(URI_DIGITS_QUERY) => {
                digits = u32::from_str(params.1.as_ref())
                    .map_err(|e| OtpError::IntegerParseError(e, URI_DIGITS_QUERY.into()))?
            }
            _ => (),
        }
    }

    if secret.is_empty() {
        return Err(OtpError::UriMissingSecret);
    }

    Ok(Totp {
        secret,
        algorithm,
        period,
        digits,
    })
}

pub fn otp_to_uri(totp: &Totp, user: &str, issuer: Option<&str>) -> Result<String, OtpError> {
    let mut uri = url::Url::parse(&format!("{OTPAUTH_SCHEME}{TOTP_TYPE}/"))
        .map_err(OtpError::UriParseError)?;

    let issuer = issuer.filter(|i| !i.is_empty());

    match issuer {
        Some(issuer) => uri.set_path(&format!("{issuer}:{user}")),
        None => uri.set_path(user),
    }

    {
        let mut query_params = uri.query_pairs_mut();

        query_params.append_pair(URI_SECRET_QUERY, &totp.secret);

        if let Some(issuer) = issuer {
            query_params.append_pair(URI_ISSUER_QUERY, issuer);
        }

        query_params
            .append_pair(URI_HASH_QUERY, &totp.algorithm.to_string())
            .append_pair(URI_DIGITS_QUERY, &totp.digits.to_string())
            .append_pair(URI_PERIOD_QUERY, &totp.period.to_string());
    }

    Ok(uri.to_string())
}
