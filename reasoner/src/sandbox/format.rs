//! Format-spec mini-language for f-string fields and `str.format`.
//!
//! Supported: `[[fill]align][sign][0][width][,|_][.precision][type]` with
//! types `d f F e E g G % s x o b`.

use crate::sandbox::error::Fault;
use crate::sandbox::value::Value;

#[derive(Debug, Default)]
struct Spec {
    fill: Option<char>,
    align: Option<char>,
    sign: Option<char>,
    zero: bool,
    width: usize,
    grouping: Option<char>,
    precision: Option<usize>,
    kind: Option<char>,
}

/// Widths beyond this are rejected; output size stays bounded.
const MAX_WIDTH: usize = 10_000;

fn parse_spec(text: &str) -> Result<Spec, Fault> {
    let invalid = || Fault::Value(format!("invalid format specifier '{text}'"));
    let chars: Vec<char> = text.chars().collect();
    let mut spec = Spec::default();
    let mut i = 0;

    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');
    if chars.len() >= 2 && is_align(chars[1]) {
        spec.fill = Some(chars[0]);
        spec.align = Some(chars[1]);
        i = 2;
    } else if chars.first().copied().is_some_and(is_align) {
        spec.align = chars.first().copied();
        i = 1;
    }
    if let Some(&c) = chars.get(i)
        && matches!(c, '+' | '-' | ' ')
    {
        spec.sign = Some(c);
        i += 1;
    }
    if chars.get(i) == Some(&'0') {
        spec.zero = true;
        i += 1;
    }
    let width_start = i;
    while chars.get(i).is_some_and(char::is_ascii_digit) {
        i += 1;
    }
    if i > width_start {
        let digits: String = chars[width_start..i].iter().collect();
        spec.width = digits.parse().map_err(|_| invalid())?;
        if spec.width > MAX_WIDTH {
            return Err(Fault::TooLarge(format!("format width {}", spec.width)));
        }
    }
    if let Some(&c) = chars.get(i)
        && matches!(c, ',' | '_')
    {
        spec.grouping = Some(c);
        i += 1;
    }
    if chars.get(i) == Some(&'.') {
        i += 1;
        let start = i;
        while chars.get(i).is_some_and(char::is_ascii_digit) {
            i += 1;
        }
        if i == start {
            return Err(invalid());
        }
        let digits: String = chars[start..i].iter().collect();
        let precision: usize = digits.parse().map_err(|_| invalid())?;
        if precision > MAX_WIDTH {
            return Err(Fault::TooLarge(format!("format precision {precision}")));
        }
        spec.precision = Some(precision);
    }
    if let Some(&c) = chars.get(i) {
        if !"dfFeEgG%sxob".contains(c) {
            return Err(invalid());
        }
        spec.kind = Some(c);
        i += 1;
    }
    if i != chars.len() {
        return Err(invalid());
    }
    Ok(spec)
}

/// Render `value` according to `spec`.
pub fn format_value(value: &Value, spec_text: &str) -> Result<String, Fault> {
    let spec = parse_spec(spec_text)?;
    let unknown = |code: char| {
        Fault::Value(format!(
            "unknown format code '{code}' for object of type '{}'",
            value.type_name()
        ))
    };

    let (negative, body, numeric) = match (spec.kind, value) {
        (Some('s') | None, Value::Str(s)) => {
            let text = match spec.precision {
                Some(p) => s.chars().take(p).collect(),
                None => s.clone(),
            };
            (false, text, false)
        }
        (Some('s'), _) => return Err(unknown('s')),
        (Some(code @ ('d' | 'x' | 'o' | 'b')), v) if v.as_int().is_some() => {
            let n = v.as_int().unwrap_or(0);
            let magnitude = n.unsigned_abs();
            let digits = match code {
                'x' => format!("{magnitude:x}"),
                'o' => format!("{magnitude:o}"),
                'b' => format!("{magnitude:b}"),
                _ => magnitude.to_string(),
            };
            (n < 0, digits, true)
        }
        (Some(code @ ('d' | 'x' | 'o' | 'b')), _) => return Err(unknown(code)),
        (None, v) if v.as_int().is_some() && spec.precision.is_none() => {
            let n = v.as_int().unwrap_or(0);
            let text = if matches!(v, Value::Bool(_)) && spec.grouping.is_none() {
                v.to_string()
            } else {
                n.unsigned_abs().to_string()
            };
            (n < 0 && !matches!(v, Value::Bool(_)), text, true)
        }
        (kind, v) if v.is_number() => {
            let x = v.as_number().unwrap_or(0.0);
            let digits = float_body(x.abs(), kind, spec.precision, v)?;
            (x.is_sign_negative() && !(x == 0.0 && kind.is_none()), digits, true)
        }
        (None, other) => (false, other.to_string(), false),
        (Some(code), _) => return Err(unknown(code)),
    };

    let body = match spec.grouping {
        Some(separator) if numeric => group_digits(&body, separator),
        _ => body,
    };
    let sign = if negative {
        "-"
    } else if numeric {
        match spec.sign {
            Some('+') => "+",
            Some(' ') => " ",
            _ => "",
        }
    } else {
        ""
    };
    Ok(pad(sign, &body, &spec, numeric))
}

fn float_body(
    x: f64,
    kind: Option<char>,
    precision: Option<usize>,
    original: &Value,
) -> Result<String, Fault> {
    if !x.is_finite() {
        let text = if x.is_nan() { "nan" } else { "inf" };
        return Ok(match kind {
            Some('F' | 'E' | 'G') => text.to_uppercase(),
            _ => text.to_string(),
        });
    }
    Ok(match kind {
        Some('f' | 'F') => format!("{:.*}", precision.unwrap_or(6), x),
        Some('%') => format!("{:.*}%", precision.unwrap_or(6), x * 100.0),
        Some(code @ ('e' | 'E')) => {
            let text = exponent_form(x, precision.unwrap_or(6));
            if code == 'E' { text.to_uppercase() } else { text }
        }
        Some(code @ ('g' | 'G')) => {
            let text = general_form(x, precision.unwrap_or(6));
            if code == 'G' { text.to_uppercase() } else { text }
        }
        None => match precision {
            Some(p) => general_form(x, p),
            None => match original {
                Value::Float(_) => Value::Float(x).to_string(),
                _ => format!("{}", x as i64),
            },
        },
        Some(code) => {
            return Err(Fault::Value(format!(
                "unknown format code '{code}' for object of type '{}'",
                original.type_name()
            )));
        }
    })
}

/// `1.500000e+03` style: signed exponent with at least two digits.
fn exponent_form(x: f64, precision: usize) -> String {
    let raw = format!("{x:.precision$e}");
    let (mantissa, exponent) = raw.split_once('e').unwrap_or((raw.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("{mantissa}e{sign}{:02}", exponent.abs())
}

/// `g` presentation: fixed or exponent form depending on magnitude, with
/// trailing zeros removed.
fn general_form(x: f64, precision: usize) -> String {
    let precision = precision.max(1);
    if x == 0.0 {
        return "0".to_string();
    }
    let probe = format!("{:.*e}", precision - 1, x);
    let exponent: i64 = probe
        .split_once('e')
        .and_then(|(_, e)| e.parse().ok())
        .unwrap_or(0);
    if exponent < -4 || exponent >= precision as i64 {
        let text = exponent_form(x, precision - 1);
        let (mantissa, exp) = text.split_once('e').unwrap_or((text.as_str(), ""));
        return format!("{}e{exp}", trim_fraction(mantissa));
    }
    let decimals = usize::try_from(precision as i64 - 1 - exponent).unwrap_or(0);
    trim_fraction(&format!("{x:.decimals$}")).to_string()
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

fn group_digits(body: &str, separator: char) -> String {
    let (integer, rest) = match body.find(|c: char| !c.is_ascii_digit()) {
        Some(index) => body.split_at(index),
        None => (body, ""),
    };
    let mut grouped = String::with_capacity(integer.len() + integer.len() / 3 + rest.len());
    for (i, c) in integer.chars().enumerate() {
        if i > 0 && (integer.len() - i) % 3 == 0 {
            grouped.push(separator);
        }
        grouped.push(c);
    }
    grouped.push_str(rest);
    grouped
}

fn pad(sign: &str, body: &str, spec: &Spec, numeric: bool) -> String {
    let len = sign.chars().count() + body.chars().count();
    if len >= spec.width {
        return format!("{sign}{body}");
    }
    let missing = spec.width - len;
    let (fill, align) = if spec.zero && spec.align.is_none() && numeric {
        ('0', '=')
    } else {
        (
            spec.fill.unwrap_or(' '),
            spec.align.unwrap_or(if numeric { '>' } else { '<' }),
        )
    };
    let padding = |n: usize| fill.to_string().repeat(n);
    match align {
        '<' => format!("{sign}{body}{}", padding(missing)),
        '^' => {
            let left = missing / 2;
            format!("{}{sign}{body}{}", padding(left), padding(missing - left))
        }
        '=' => format!("{sign}{}{body}", padding(missing)),
        _ => format!("{}{sign}{body}", padding(missing)),
    }
}

/// `template.format(*args, **kwargs)` with `{}`, `{0}`, `{name}` and
/// `{...:spec}` fields.
pub fn str_format(
    template: &str,
    args: &[Value],
    kwargs: &[(String, Value)],
) -> Result<String, Fault> {
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    let mut auto_index = 0usize;
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => {
                return Err(Fault::Value(
                    "single '}' encountered in format string".to_string(),
                ));
            }
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => field.push(ch),
                        None => {
                            return Err(Fault::Value(
                                "expected '}' before end of string".to_string(),
                            ));
                        }
                    }
                }
                let (name, spec) = match field.split_once(':') {
                    Some((name, spec)) => (name, Some(spec)),
                    None => (field.as_str(), None),
                };
                let name = name.trim_end_matches("!r").trim_end_matches("!s");
                let value = if name.is_empty() {
                    let value = args.get(auto_index);
                    auto_index += 1;
                    value
                } else if let Ok(index) = name.parse::<usize>() {
                    args.get(index)
                } else {
                    kwargs.iter().find(|(k, _)| k == name).map(|(_, v)| v)
                };
                let value = value.ok_or_else(|| {
                    Fault::Index(format!("replacement field '{name}' has no matching argument"))
                })?;
                let rendered = match spec {
                    Some(spec) if !spec.is_empty() => format_value(value, spec)?,
                    _ => value.to_string(),
                };
                out.push_str(&rendered);
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(value: Value, spec: &str) -> String {
        format_value(&value, spec).expect("format")
    }

    #[test]
    fn fixed_point_and_percent() {
        assert_eq!(fmt(Value::Float(3.14159), ".2f"), "3.14");
        assert_eq!(fmt(Value::Int(7), ".1f"), "7.0");
        assert_eq!(fmt(Value::Float(0.256), ".1%"), "25.6%");
    }

    #[test]
    fn grouping_and_width() {
        assert_eq!(fmt(Value::Int(1_234_567), ","), "1,234,567");
        assert_eq!(fmt(Value::Float(-1234.5), ",.2f"), "-1,234.50");
        assert_eq!(fmt(Value::Int(42), "05d"), "00042");
        assert_eq!(fmt(Value::Int(-42), "05d"), "-0042");
        assert_eq!(fmt(Value::Str("ab".to_string()), ">4"), "  ab");
        assert_eq!(fmt(Value::Str("ab".to_string()), "*^6"), "**ab**");
    }

    #[test]
    fn exponent_and_general_forms() {
        assert_eq!(fmt(Value::Float(1500.0), ".2e"), "1.50e+03");
        assert_eq!(fmt(Value::Float(0.0001234), "g"), "0.0001234");
        assert_eq!(fmt(Value::Float(123456789.0), "g"), "1.23457e+08");
        assert_eq!(fmt(Value::Float(2.50), "g"), "2.5");
    }

    #[test]
    fn rejects_mismatched_codes() {
        assert!(format_value(&Value::Float(1.5), "d").is_err());
        assert!(format_value(&Value::Str("x".to_string()), ".2f").is_err());
        assert!(format_value(&Value::Int(1), "q").is_err());
    }

    #[test]
    fn str_format_handles_auto_and_named_fields() {
        let out = str_format(
            "{} + {} = {total:.1f} {{ok}}",
            &[Value::Int(1), Value::Int(2)],
            &[("total".to_string(), Value::Float(3.0))],
        )
        .expect("format");
        assert_eq!(out, "1 + 2 = 3.0 {ok}");
        assert!(str_format("{}", &[], &[]).is_err());
    }
}
