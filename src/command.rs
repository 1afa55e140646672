use crate::config::Config;
use crate::error::InvalidPattern;
use crate::pattern::Pattern;

pub const SHINE_SELECTOR: &str = "Mode_Shine";

/// Turns `<SELECTOR> [on|off|CYCLES]` into a pattern.
///
/// `SELECTOR` is an LED name, several LED names joined by commas (blink
/// only), or `Mode_Shine`. The pattern is validated, so nothing reaches the
/// kernel for a malformed request.
pub fn parse(config: &Config, selector: &str, arg: Option<&str>) -> Result<Pattern, InvalidPattern> {
    let pattern = if selector == SHINE_SELECTOR {
        config.shine_pattern(arg.map(parse_cycles).transpose()?)?
    } else {
        let names: Vec<&str> = selector.split(',').map(str::trim).collect();
        let arg = arg.ok_or_else(|| InvalidPattern::MissingArgument(selector.to_string()))?;
        match (arg, names.as_slice()) {
            ("on", [name]) | ("off", [name]) => Pattern::SetState {
                line: config.resolve(name)?,
                on: arg == "on",
            },
            ("on", _) | ("off", _) => {
                return Err(InvalidPattern::UnknownSelector(selector.to_string()))
            }
            (cycles, names) => config.blink_pattern(names, parse_cycles(cycles)?)?,
        }
    };
    pattern.validate()?;
    Ok(pattern)
}

fn parse_cycles(arg: &str) -> Result<u32, InvalidPattern> {
    arg.trim()
        .parse()
        .map_err(|_| InvalidPattern::MalformedCycles(arg.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    #[test]
    fn single_led_on_off() {
        let config = Config::default();
        assert_eq!(
            parse(&config, "LED1", Some("on")),
            Ok(Pattern::SetState { line: 396, on: true })
        );
        assert_eq!(
            parse(&config, "LED4", Some("off")),
            Ok(Pattern::SetState { line: 389, on: false })
        );
    }

    #[test]
    fn cycle_count_blinks() {
        let config = Config::default();
        assert_eq!(
            parse(&config, "LED2,LED1", Some("3")),
            Ok(Pattern::Blink {
                lines: BTreeSet::from([396, 397]),
                cycles: 3,
                on: Duration::from_millis(500),
                off: Duration::from_millis(500),
            })
        );
    }

    #[test]
    fn shine_uses_configured_pairs() {
        let config = Config::default();
        assert_eq!(
            parse(&config, "Mode_Shine", Some("2")),
            Ok(Pattern::Shine {
                pair_a: BTreeSet::from([396, 397]),
                pair_b: BTreeSet::from([254, 389]),
                cycles: 2,
                phase: Duration::from_millis(300),
            })
        );
        let Ok(Pattern::Shine { cycles, .. }) = parse(&config, "Mode_Shine", None) else {
            panic!("expected a shine pattern");
        };
        assert_eq!(cycles, 5);
    }

    #[test]
    fn rejects_bad_input() {
        let config = Config::default();
        assert_eq!(
            parse(&config, "LED7", Some("on")),
            Err(InvalidPattern::UnknownSelector("LED7".into()))
        );
        assert_eq!(
            parse(&config, "LED1", Some("twice")),
            Err(InvalidPattern::MalformedCycles("twice".into()))
        );
        assert_eq!(
            parse(&config, "LED1", Some("0")),
            Err(InvalidPattern::ZeroCycles)
        );
        assert_eq!(
            parse(&config, "Mode_Shine", Some("-1")),
            Err(InvalidPattern::MalformedCycles("-1".into()))
        );
        assert_eq!(
            parse(&config, "LED1", None),
            Err(InvalidPattern::MissingArgument("LED1".into()))
        );
        assert_eq!(
            parse(&config, "LED1,LED2", Some("on")),
            Err(InvalidPattern::UnknownSelector("LED1,LED2".into()))
        );
    }
}
